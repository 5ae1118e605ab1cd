//! ELF object reader for compiled BPF programs.
//!
//! Parses a relocatable BPF ELF into a [`CollectionSpec`]: one program per
//! executable section, map definitions from the legacy `maps` section, and
//! function parameter counts plus source line info from the `.BTF` /
//! `.BTF.ext` sections. Call and map relocations become symbolic references
//! on the decoded instructions, so the stream can be rewritten freely and
//! re-resolved at load time.

use std::collections::{BTreeMap, HashMap};

use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionKind, SymbolKind};

use crate::insn::{Insn, PSEUDO_MAP_FD};
use crate::instrument::COVER_MAP_NAME;

mod btf;
mod prog_type;

pub use prog_type::ProgType;

#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("parse object file: {0}")]
    Object(#[from] object::Error),

    #[error("section '{section}' is malformed: {reason}")]
    MalformedSection { section: String, reason: String },

    #[error("no BPF programs found in the object file")]
    NoPrograms,
}

/// Definition of one BPF map, mirroring the legacy `struct bpf_map_def`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

/// BPF_MAP_TYPE_ARRAY
const MAP_TYPE_ARRAY: u32 = 2;

impl MapSpec {
    /// The coverage map: a single-entry array whose value is a contiguous
    /// run of 16-bit block counters, one per block plus a spare.
    pub fn cover_map(block_count: usize) -> MapSpec {
        MapSpec {
            name: COVER_MAP_NAME.to_string(),
            map_type: MAP_TYPE_ARRAY,
            key_size: 4,
            value_size: 2 * (block_count as u32 + 1),
            max_entries: 1,
            map_flags: 0,
        }
    }
}

/// One program from the object file: the decoded instruction stream with
/// symbols, references and line info attached.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub section: String,
    pub prog_type: ProgType,
    pub insns: Vec<Insn>,
    /// Declared parameter count per function symbol, from BTF.
    pub func_params: HashMap<String, usize>,
}

/// Everything the loader needs from one object file.
#[derive(Debug, Clone, Default)]
pub struct CollectionSpec {
    pub programs: BTreeMap<String, ProgramSpec>,
    pub maps: BTreeMap<String, MapSpec>,
    pub license: String,
}

/// Parse a relocatable BPF ELF object.
pub fn parse_elf(data: &[u8]) -> Result<CollectionSpec, ElfError> {
    let file = object::File::parse(data)?;
    let little_endian = file.is_little_endian();

    let license = file
        .section_by_name("license")
        .and_then(|s| s.data().ok().map(cstr))
        .unwrap_or_default();

    // BTF is optional; a malformed section degrades to no metadata.
    let btf_data = section_data(&file, ".BTF");
    let btf_ext_data = section_data(&file, ".BTF.ext");
    let btf = btf::parse(btf_data.as_deref(), btf_ext_data.as_deref(), little_endian);

    let mut spec = CollectionSpec {
        license,
        ..CollectionSpec::default()
    };

    if let Some(section) = file.section_by_name("maps") {
        parse_maps(&file, &section, little_endian, &mut spec.maps)?;
    }

    // Shared sub-programs live in .text; they are appended to every program
    // that calls into them.
    let text_funcs = match file.section_by_name(".text") {
        Some(section) if section.size() > 0 => {
            Some(decode_section(&file, &section, little_endian, &btf, &spec.maps)?)
        }
        _ => None,
    };

    for section in file.sections() {
        let name = section.name().unwrap_or_default().to_string();
        if section.kind() != SectionKind::Text || name == ".text" || name.is_empty() {
            continue;
        }
        if section.size() == 0 {
            continue;
        }

        let mut insns = decode_section(&file, &section, little_endian, &btf, &spec.maps)?;

        let Some(prog_name) = insns.first().and_then(|i| i.symbol()).map(str::to_string) else {
            return Err(ElfError::MalformedSection {
                section: name,
                reason: "no function symbol at section start".to_string(),
            });
        };

        // Pull in the .text sub-programs when anything here calls out of the
        // section.
        if let Some(text) = &text_funcs {
            let local: std::collections::HashSet<_> = insns
                .iter()
                .filter_map(|i| i.symbol().map(str::to_string))
                .collect();
            let calls_out = insns.iter().any(|i| {
                i.is_function_call()
                    && i.reference().is_some_and(|r| !local.contains(r))
            });
            if calls_out {
                insns.extend(text.iter().cloned());
            }
        }

        let prog_type = ProgType::for_section(&name);
        spec.programs.insert(
            prog_name.clone(),
            ProgramSpec {
                name: prog_name,
                section: name,
                prog_type,
                insns,
                func_params: btf.func_params.clone(),
            },
        );
    }

    if spec.programs.is_empty() {
        return Err(ElfError::NoPrograms);
    }

    Ok(spec)
}

fn section_data(file: &object::File, name: &str) -> Option<Vec<u8>> {
    file.section_by_name(name)
        .and_then(|s| s.data().ok().map(|d| d.to_vec()))
}

fn cstr(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn read_u32(data: &[u8], off: usize, little_endian: bool) -> Option<u32> {
    let bytes: [u8; 4] = data.get(off..off + 4)?.try_into().ok()?;
    Some(if little_endian {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    })
}

/// Legacy `maps` section: one `bpf_map_def` per symbol.
fn parse_maps(
    file: &object::File,
    section: &object::Section,
    little_endian: bool,
    maps: &mut BTreeMap<String, MapSpec>,
) -> Result<(), ElfError> {
    let data = section.data()?;

    for symbol in file.symbols() {
        if symbol.section_index() != Some(section.index()) {
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        if name.is_empty() {
            continue;
        }

        let base = symbol.address() as usize;
        let field = |idx: usize| {
            read_u32(data, base + idx * 4, little_endian).ok_or_else(|| {
                ElfError::MalformedSection {
                    section: "maps".to_string(),
                    reason: format!("map '{name}' definition is truncated"),
                }
            })
        };

        maps.insert(
            name.to_string(),
            MapSpec {
                name: name.to_string(),
                map_type: field(0)?,
                key_size: field(1)?,
                value_size: field(2)?,
                max_entries: field(3)?,
                map_flags: field(4)?,
            },
        );
    }

    Ok(())
}

/// Decode one executable section: raw slots to instructions, function
/// symbols onto their first instruction, relocations and same-section calls
/// to symbolic references, BTF line info onto each instruction.
fn decode_section(
    file: &object::File,
    section: &object::Section,
    little_endian: bool,
    btf: &btf::BtfInfo,
    maps: &BTreeMap<String, MapSpec>,
) -> Result<Vec<Insn>, ElfError> {
    let name = section.name().unwrap_or_default().to_string();
    let data = section.data()?;

    let malformed = |reason: String| ElfError::MalformedSection {
        section: name.clone(),
        reason,
    };

    if data.len() % 8 != 0 {
        return Err(malformed(format!(
            "size {} is not a multiple of the instruction size",
            data.len()
        )));
    }

    let read_i16 = |off: usize| {
        let bytes = [data[off], data[off + 1]];
        if little_endian {
            i16::from_le_bytes(bytes)
        } else {
            i16::from_be_bytes(bytes)
        }
    };

    let mut insns: Vec<Insn> = Vec::with_capacity(data.len() / 8);
    let mut slot_to_idx: HashMap<u64, usize> = HashMap::new();
    let mut byte_off = 0usize;
    let mut slot = 0u64;

    while byte_off + 8 <= data.len() {
        let opcode = data[byte_off];
        let regs = data[byte_off + 1];
        let offset = read_i16(byte_off + 2);
        let imm = read_u32(data, byte_off + 4, little_endian).unwrap_or(0) as i32;

        let mut insn = Insn::new(opcode, regs & 0x0f, regs >> 4, offset, imm as i64);
        slot_to_idx.insert(slot, insns.len());

        if insn.is_dword_load() {
            if byte_off + 16 > data.len() {
                return Err(malformed("truncated 64-bit immediate load".to_string()));
            }
            let hi = read_u32(data, byte_off + 12, little_endian).unwrap_or(0);
            insn.imm = ((hi as u64) << 32 | imm as u32 as u64) as i64;
            slot_to_idx.insert(slot + 1, insns.len());
            slot += 2;
            byte_off += 16;
        } else {
            slot += 1;
            byte_off += 8;
        }

        insns.push(insn);
    }

    // Function symbols name their first instruction.
    for symbol in file.symbols() {
        if symbol.section_index() != Some(section.index()) {
            continue;
        }
        if !matches!(symbol.kind(), SymbolKind::Text) {
            continue;
        }
        let Ok(sym_name) = symbol.name() else { continue };
        if sym_name.is_empty() {
            continue;
        }
        if let Some(&idx) = slot_to_idx.get(&(symbol.address() / 8)) {
            insns[idx].set_symbol(Some(sym_name.to_string()));
        }
    }

    // Relocations become symbolic references: map loads and out-of-section
    // calls.
    for (reloc_off, reloc) in section.relocations() {
        let RelocationTarget::Symbol(sym_idx) = reloc.target() else {
            continue;
        };
        let Ok(symbol) = file.symbol_by_index(sym_idx) else {
            continue;
        };
        let Ok(target_name) = symbol.name() else { continue };

        let Some(&idx) = slot_to_idx.get(&(reloc_off / 8)) else {
            return Err(malformed(format!(
                "relocation at {reloc_off} outside the section"
            )));
        };

        let insn = &mut insns[idx];
        if insn.is_dword_load() {
            if !maps.contains_key(target_name) {
                log::warn!(
                    "relocation for '{target_name}' in section '{name}' is not a known map; \
                     global data is not supported"
                );
            }
            insn.src = PSEUDO_MAP_FD;
            insn.set_reference(Some(target_name.to_string()));
        } else if insn.is_function_call() {
            insn.imm = -1;
            insn.set_reference(Some(target_name.to_string()));
        } else {
            log::warn!("unsupported relocation against '{target_name}' in section '{name}'");
        }
    }

    // Same-section calls may be offset-based with no relocation; resolve
    // them against the target's function symbol.
    let offsets = crate::insn::raw_offsets(&insns);
    let mut call_fixups = Vec::new();
    for (idx, insn) in insns.iter().enumerate() {
        if insn.is_function_call() && insn.reference().is_none() {
            let target_slot = offsets[idx].wrapping_add_signed(insn.imm + 1);
            call_fixups.push((idx, target_slot));
        }
    }
    for (idx, target_slot) in call_fixups {
        let target_sym = slot_to_idx
            .get(&target_slot)
            .and_then(|&t| insns[t].symbol())
            .map(str::to_string);
        match target_sym {
            Some(sym) => {
                insns[idx].imm = -1;
                insns[idx].set_reference(Some(sym));
            }
            None => log::warn!(
                "call at instruction {idx} in section '{name}' targets no function symbol"
            ),
        }
    }

    // Attach source lines.
    if let Some(lines) = btf.lines.get(&name) {
        for (insn_byte_off, line) in lines {
            if let Some(&idx) = slot_to_idx.get(&(*insn_byte_off as u64 / 8)) {
                insns[idx].line = Some(line.clone());
            }
        }
    }

    Ok(insns)
}
