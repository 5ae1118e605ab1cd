//! Minimal BTF reader.
//!
//! Pulls exactly two things out of `.BTF` / `.BTF.ext`: the declared
//! parameter count of every function (FUNC -> FUNC_PROTO vlen), which the
//! instrumentation prologue needs to park argument registers, and the
//! per-instruction source line table driving the block list. Everything
//! else in BTF is skipped over. Malformed or absent BTF degrades to empty
//! metadata, never an error; programs without sub-programs load fine
//! without it.

use std::collections::HashMap;

use crate::insn::SourceLine;

const BTF_MAGIC: u16 = 0xeb9f;

const KIND_INT: u32 = 1;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_DECL_TAG: u32 = 17;
const KIND_ENUM64: u32 = 19;

/// Function and line metadata extracted from the object's BTF.
#[derive(Debug, Clone, Default)]
pub struct BtfInfo {
    /// Function symbol -> declared parameter count.
    pub func_params: HashMap<String, usize>,
    /// Section name -> (instruction byte offset, source line).
    pub lines: HashMap<String, Vec<(u32, SourceLine)>>,
}

/// Parse whatever BTF the object carries, best-effort.
pub fn parse(btf: Option<&[u8]>, btf_ext: Option<&[u8]>, little_endian: bool) -> BtfInfo {
    let mut info = BtfInfo::default();

    let Some(btf) = btf else { return info };
    let reader = Reader {
        data: btf,
        little_endian,
    };

    let Some(strings) = parse_btf(&reader, &mut info) else {
        log::warn!(".BTF section is malformed, continuing without function metadata");
        return BtfInfo::default();
    };

    if let Some(ext) = btf_ext {
        let ext_reader = Reader {
            data: ext,
            little_endian,
        };
        if parse_btf_ext(&ext_reader, &strings, &mut info).is_none() {
            log::warn!(".BTF.ext section is malformed, continuing without line info");
            info.lines.clear();
        }
    }

    info
}

struct Reader<'a> {
    data: &'a [u8],
    little_endian: bool,
}

impl Reader<'_> {
    fn u16(&self, off: usize) -> Option<u16> {
        let bytes: [u8; 2] = self.data.get(off..off + 2)?.try_into().ok()?;
        Some(if self.little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        })
    }

    fn u32(&self, off: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(off..off + 4)?.try_into().ok()?;
        Some(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct BtfType {
    kind: u32,
    name_off: u32,
    vlen: u32,
    size_or_type: u32,
}

/// String table slice of the `.BTF` section.
struct Strings(Vec<u8>);

impl Strings {
    fn get(&self, off: u32) -> Option<String> {
        let start = off as usize;
        let rest = self.0.get(start..)?;
        let end = rest.iter().position(|b| *b == 0)?;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

fn parse_btf(reader: &Reader, info: &mut BtfInfo) -> Option<Strings> {
    if reader.u16(0)? != BTF_MAGIC {
        return None;
    }
    let hdr_len = reader.u32(4)? as usize;
    let type_off = reader.u32(8)? as usize;
    let type_len = reader.u32(12)? as usize;
    let str_off = reader.u32(16)? as usize;
    let str_len = reader.u32(20)? as usize;

    let strings = Strings(
        reader
            .data
            .get(hdr_len + str_off..hdr_len + str_off + str_len)?
            .to_vec(),
    );

    // Type ids are 1-based; id 0 is void.
    let mut types: Vec<BtfType> = Vec::new();
    let mut off = hdr_len + type_off;
    let end = hdr_len + type_off + type_len;

    while off + 12 <= end {
        let name_off = reader.u32(off)?;
        let type_info = reader.u32(off + 4)?;
        let size_or_type = reader.u32(off + 8)?;
        let kind = (type_info >> 24) & 0x1f;
        let vlen = type_info & 0xffff;
        off += 12;

        // Per-kind payload after the common header.
        let extra = match kind {
            KIND_INT | KIND_VAR | KIND_DECL_TAG => 4,
            KIND_ARRAY => 12,
            KIND_STRUCT | KIND_UNION | KIND_DATASEC | KIND_ENUM64 => vlen as usize * 12,
            KIND_ENUM | KIND_FUNC_PROTO => vlen as usize * 8,
            _ => 0,
        };
        off += extra;

        types.push(BtfType {
            kind,
            name_off,
            vlen,
            size_or_type,
        });
    }

    for ty in &types {
        if ty.kind != KIND_FUNC {
            continue;
        }
        let proto_id = ty.size_or_type as usize;
        let Some(proto) = proto_id.checked_sub(1).and_then(|i| types.get(i)) else {
            continue;
        };
        if proto.kind != KIND_FUNC_PROTO {
            continue;
        }
        if let Some(name) = strings.get(ty.name_off) {
            info.func_params.insert(name, proto.vlen as usize);
        }
    }

    Some(strings)
}

fn parse_btf_ext(reader: &Reader, strings: &Strings, info: &mut BtfInfo) -> Option<()> {
    if reader.u16(0)? != BTF_MAGIC {
        return None;
    }
    let hdr_len = reader.u32(4)? as usize;
    let line_info_off = reader.u32(16)? as usize;
    let line_info_len = reader.u32(20)? as usize;

    if line_info_len == 0 {
        return Some(());
    }

    let start = hdr_len + line_info_off;
    let end = start + line_info_len;
    let rec_size = reader.u32(start)? as usize;
    if rec_size < 16 {
        return None;
    }

    let mut off = start + 4;
    while off + 8 <= end {
        let sec_name_off = reader.u32(off)?;
        let num_info = reader.u32(off + 4)? as usize;
        off += 8;

        let sec_name = strings.get(sec_name_off)?;
        let entries = info.lines.entry(sec_name).or_default();

        for _ in 0..num_info {
            if off + rec_size > end {
                return None;
            }
            let insn_off = reader.u32(off)?;
            let file_name_off = reader.u32(off + 4)?;
            let line_col = reader.u32(off + 12)?;
            off += rec_size;

            let Some(file) = strings.get(file_name_off) else {
                continue;
            };
            entries.push((
                insn_off,
                SourceLine {
                    file,
                    line: line_col >> 10,
                },
            ));
        }
    }

    Some(())
}
