//! Coverage output: block lists, counter readback and rendering.
//!
//! The block list is the bridge between kernel counters and source code.
//! Its outer index is the block id, matching the 16-bit counter at offset
//! `2 * id` inside the coverage map value; each inner entry points at one
//! source line a block was compiled from. `StartCol=2` / `EndCol=2000` /
//! `NumStmt=1` are fixed conventions meaning whole-line coverage.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cfg::ProgBlock;

#[derive(Debug, thiserror::Error)]
pub enum CoverError {
    #[error("coverage map value is {got} bytes, expected at least {want}")]
    ValueTooShort { got: usize, want: usize },

    #[error("read source file '{file}': {source}")]
    SourceFile {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("error looking up coverage output: {0}")]
    MapRead(#[source] io::Error),
}

/// Reference to one covered source line, in go-cover profile terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverBlock {
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "StartLine")]
    pub start_line: u32,
    #[serde(rename = "StartCol")]
    pub start_col: u32,
    #[serde(rename = "EndLine")]
    pub end_line: u32,
    #[serde(rename = "EndCol")]
    pub end_col: u32,
    #[serde(rename = "NumStmt")]
    pub num_stmt: u32,
    #[serde(rename = "Count")]
    pub count: u32,
}

impl CoverBlock {
    fn whole_line(filename: String, line: u32) -> CoverBlock {
        CoverBlock {
            filename,
            start_line: line,
            start_col: 2,
            end_line: line,
            end_col: 2000,
            num_stmt: 1,
            count: 0,
        }
    }
}

/// Convert a CFG into a block list: outer index is the block id, inner
/// entries are the source lines of the block's instructions. Blocks with no
/// debug-info origin get an empty inner list.
pub fn cfg_to_block_list(blocks: &[ProgBlock]) -> Vec<Vec<CoverBlock>> {
    let mut block_list = Vec::with_capacity(blocks.len());

    for block in blocks {
        let mut lines = Vec::new();
        for insn in &block.insns {
            let Some(src) = &insn.line else { continue };
            lines.push(CoverBlock::whole_line(src.file.clone(), src.line));
        }
        block_list.push(lines);
    }

    block_list
}

/// The 16-bit counter array is read back in the byte order of the machine
/// that ran the programs, which is this machine. Probe it once rather than
/// assuming little-endian.
fn native_u16(bytes: [u8; 2]) -> u16 {
    if cfg!(target_endian = "big") {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    }
}

/// Apply a raw coverage map value to the block list: counter `i` becomes the
/// count of every line in block `i`.
pub fn apply_cover_map(value: &[u8], block_list: &mut [Vec<CoverBlock>]) -> Result<(), CoverError> {
    let want = block_list.len() * 2;
    if value.len() < want {
        return Err(CoverError::ValueTooShort {
            got: value.len(),
            want,
        });
    }

    for (id, lines) in block_list.iter_mut().enumerate() {
        let count = native_u16([value[id * 2], value[id * 2 + 1]]) as u32;
        for line in lines {
            line.count = count;
        }
    }

    Ok(())
}

/// Per-file map of line -> count, the shape both renderers work from. A
/// line covered by several blocks reports the highest count.
fn line_counts(block_list: &[Vec<CoverBlock>]) -> BTreeMap<&str, BTreeMap<u32, u32>> {
    let mut files: BTreeMap<&str, BTreeMap<u32, u32>> = BTreeMap::new();
    for block in block_list {
        for line in block {
            let entry = files
                .entry(line.filename.as_str())
                .or_default()
                .entry(line.start_line)
                .or_default();
            *entry = (*entry).max(line.count);
        }
    }
    files
}

/// Write the block list in go-cover profile format.
pub fn write_go_cover(
    block_list: &[Vec<CoverBlock>],
    out: &mut impl Write,
    mode: &str,
) -> io::Result<()> {
    writeln!(out, "mode: {mode}")?;
    for (file, lines) in line_counts(block_list) {
        for (line, count) in lines {
            writeln!(out, "{file}:{line}.2,{line}.2000 1 {count}")?;
        }
    }
    Ok(())
}

/// Write a self-contained HTML report. Files whose source is readable are
/// rendered line by line with covered/uncovered highlighting; unreadable
/// files fall back to a bare line/count table.
pub fn write_html(block_list: &[Vec<CoverBlock>], out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>coverage</title>\n\
         <style>\n\
         body {{ background: #000; color: rgb(80, 80, 80); font-family: monospace; }}\n\
         .cov {{ color: rgb(44, 212, 149); }}\n\
         .uncov {{ color: rgb(192, 0, 0); }}\n\
         .count {{ color: rgb(80, 80, 80); }}\n\
         pre {{ margin: 0; }}\n\
         </style>\n</head>\n<body>"
    )?;

    for (file, lines) in line_counts(block_list) {
        writeln!(out, "<h2>{}</h2>", escape_html(file))?;
        writeln!(out, "<pre>")?;

        match fs::read_to_string(file) {
            Ok(source) => {
                for (i, text) in source.lines().enumerate() {
                    let lineno = i as u32 + 1;
                    let mut rendered = String::new();
                    let class = match lines.get(&lineno) {
                        Some(0) => "uncov",
                        Some(_) => "cov",
                        None => "count",
                    };
                    let _ = write!(rendered, "<span class=\"{class}\">");
                    let _ = match lines.get(&lineno) {
                        Some(count) => write!(rendered, "{count:7} "),
                        None => write!(rendered, "        "),
                    };
                    let _ = write!(rendered, "{}</span>", escape_html(text));
                    writeln!(out, "{rendered}")?;
                }
            }
            Err(_) => {
                for (line, count) in &lines {
                    let class = if *count == 0 { "uncov" } else { "cov" };
                    writeln!(out, "<span class=\"{class}\">line {line}: {count}</span>")?;
                }
            }
        }

        writeln!(out, "</pre>")?;
    }

    writeln!(out, "</body>\n</html>")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Interpolate coverage across source lines the instrumentation has no
/// direct counter for.
///
/// Debug info only attaches a handful of lines to each block. Lines lying
/// between two counted lines of the same file whose counts agree almost
/// certainly executed with them, so they are filled in with that count;
/// disagreeing neighbours leave the gap alone. Blank lines and lines
/// outside any counted range stay unreported.
///
/// Returns a new block list with the interpolated lines appended as an
/// extra entry, so renderers pick them up without disturbing block ids.
pub fn interpolate(block_list: &[Vec<CoverBlock>]) -> Result<Vec<Vec<CoverBlock>>, CoverError> {
    let mut extra: Vec<CoverBlock> = Vec::new();

    for (file, lines) in line_counts(block_list) {
        let source = fs::read_to_string(file).map_err(|source| CoverError::SourceFile {
            file: file.to_string(),
            source,
        })?;
        let text: Vec<&str> = source.lines().collect();

        let counted: Vec<(u32, u32)> = lines.iter().map(|(l, c)| (*l, *c)).collect();
        for pair in counted.windows(2) {
            let (from, from_count) = pair[0];
            let (to, to_count) = pair[1];
            if from_count != to_count {
                continue;
            }

            for line in from + 1..to {
                let blank = text
                    .get(line as usize - 1)
                    .is_none_or(|t| t.trim().is_empty());
                if blank {
                    continue;
                }
                let mut block = CoverBlock::whole_line(file.to_string(), line);
                block.count = from_count;
                extra.push(block);
            }
        }
    }

    let mut out = block_list.to_vec();
    if !extra.is_empty() {
        out.push(extra);
    }
    Ok(out)
}

/// Read the pinned coverage map and fill the counts into a block list.
pub fn collect(
    covermap: &impl std::os::fd::AsRawFd,
    block_list: &mut [Vec<CoverBlock>],
) -> Result<(), CoverError> {
    let key = 0u32.to_ne_bytes();
    let mut value = vec![0u8; 2 * (block_list.len() + 1)];
    crate::loader::sys::map_lookup(covermap, &key, &mut value).map_err(CoverError::MapRead)?;
    apply_cover_map(&value, block_list)
}

/// Load a block list from its JSON serialization.
pub fn read_block_list(path: &Path) -> io::Result<Vec<Vec<CoverBlock>>> {
    let file = fs::File::open(path)?;
    serde_json::from_reader(io::BufReader::new(file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a block list as JSON.
pub fn write_block_list(block_list: &[Vec<CoverBlock>], path: &Path) -> io::Result<()> {
    let file = fs::File::create(path)?;
    serde_json::to_writer(io::BufWriter::new(file), block_list)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
