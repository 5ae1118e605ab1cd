//! End-to-end tests for the instrumentation pipeline: ELF in, rewritten
//! encodable program and block list out. The kernel is not involved; the
//! verifier diagnostic is handcrafted the way the kernel would emit it.

use std::collections::BTreeMap;

use object::write::{Object, Relocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionFlags, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use coverbee::cfg::program_blocks;
use coverbee::cover;
use coverbee::elf::{parse_elf, ProgType};
use coverbee::insn::{encode_program, opcode, resolve_references, Insn, Reg};
use coverbee::instrument::{instrument_collection, COVER_MAP_NAME};
use coverbee::verifier_log::merged_per_instruction;

/// xdp_counter: branch over a map write.
///
/// ```text
/// 0: r1 = map[counters]   (slots 0-1)
/// 1: if r0 == 0 goto +1   (slot 2)
/// 2: mov r0, 2            (slot 3)
/// 3: exit                 (slot 4)
/// ```
fn fixture_elf() -> Vec<u8> {
    let insns = [
        Insn::new(opcode::LD_DW_IMM, 1, 0, 0, 0),
        Insn::jeq_imm(Reg::R0, 0, 1),
        Insn::mov64_imm(Reg::R0, 2),
        Insn::exit(),
    ];
    let mut bytecode = Vec::new();
    for insn in &insns {
        insn.encode_into(&mut bytecode);
    }

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);

    let license_id = obj.add_section(vec![], b"license".to_vec(), SectionKind::Data);
    obj.append_section_data(license_id, b"GPL\0", 1);

    let maps_id = obj.add_section(vec![], b"maps".to_vec(), SectionKind::Data);
    let mut map_def = Vec::new();
    for field in [2u32, 4, 8, 1, 0] {
        map_def.extend_from_slice(&field.to_le_bytes());
    }
    let map_off = obj.append_section_data(maps_id, &map_def, 4);
    let map_sym = obj.add_symbol(Symbol {
        name: b"counters".to_vec(),
        value: map_off,
        size: map_def.len() as u64,
        kind: SymbolKind::Data,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(maps_id),
        flags: SymbolFlags::Elf {
            st_info: (object::elf::STB_GLOBAL << 4) | object::elf::STT_OBJECT,
            st_other: object::elf::STV_DEFAULT,
        },
    });

    let prog_id = obj.add_section(vec![], b"xdp/counter".to_vec(), SectionKind::Text);
    obj.section_mut(prog_id).flags = SectionFlags::Elf {
        sh_flags: (object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR) as u64,
    };
    obj.append_section_data(prog_id, &bytecode, 8);
    obj.add_symbol(Symbol {
        name: b"xdp_counter".to_vec(),
        value: 0,
        size: bytecode.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(prog_id),
        flags: SymbolFlags::Elf {
            st_info: (object::elf::STB_GLOBAL << 4) | object::elf::STT_FUNC,
            st_other: object::elf::STV_DEFAULT,
        },
    });
    obj.add_relocation(
        prog_id,
        Relocation {
            offset: 0,
            symbol: map_sym,
            addend: 0,
            flags: RelocationFlags::Elf { r_type: 1 },
        },
    )
    .unwrap();

    obj.write().unwrap()
}

/// The verbose diagnostic the verifier would emit for the fixture program.
const FIXTURE_LOG: &str = "\
0: R1=ctx(off=0,imm=0) R10=fp0
0: (18) r1 = 0x0 ll; R1_w=map_ptr(off=0,ks=4,vs=8,imm=0)
2: (15) if r0 == 0x0 goto pc+1
3: (b7) r0 = 2; R0_w=2
4: (95) exit
from 2 to 4: R0_w=scalar() R1_w=map_ptr(off=0,ks=4,vs=8,imm=0) R10=fp0
4: (95) exit
processed 6 insns (limit 1000000) max_states_per_insn 1 total_states 1 peak_states 1 mark_read 1
";

#[test]
fn test_elf_to_instrumented_collection() {
    let mut spec = parse_elf(&fixture_elf()).unwrap();
    assert_eq!(spec.programs.len(), 1);
    assert_eq!(spec.programs["xdp_counter"].prog_type, ProgType::Xdp);

    // the fixture carries no BTF; supply the parameter metadata the
    // instrumentation needs
    spec.programs
        .get_mut("xdp_counter")
        .unwrap()
        .func_params
        .insert("xdp_counter".to_string(), 1);

    let mut logs = BTreeMap::new();
    logs.insert("xdp_counter".to_string(), FIXTURE_LOG.to_string());

    let blocks = instrument_collection(&mut spec, &logs, None).unwrap();

    // three blocks: entry+branch, fall-through, jump target
    assert_eq!(blocks.len(), 3);

    // the coverage map sized for them
    let cover_map = &spec.maps[COVER_MAP_NAME];
    assert_eq!(cover_map.max_entries, 1);
    assert_eq!(cover_map.value_size, 2 * (3 + 1));

    let insns = &spec.programs["xdp_counter"].insns;

    // one prologue lookup, three counter updates
    let lookups = insns
        .iter()
        .filter(|i| i.opcode.0 == opcode::CALL && i.src == 0 && i.imm == 1)
        .count();
    assert_eq!(lookups, 1);
    let counter_stores = insns
        .iter()
        .filter(|i| i.opcode.0 == opcode::BPF_STX | opcode::BPF_H | opcode::BPF_MEM)
        .count();
    assert_eq!(counter_stores, 3);

    // both map references survive: the program's own map and the covermap
    let map_refs: Vec<_> = insns
        .iter()
        .filter(|i| i.is_map_load())
        .filter_map(|i| i.reference())
        .collect();
    assert!(map_refs.contains(&"counters"));
    assert!(map_refs.contains(&COVER_MAP_NAME));

    // the rewritten program still resolves and encodes
    let mut resolved = insns.clone();
    resolve_references(&mut resolved).unwrap();
    let bytes = encode_program(&resolved);
    assert_eq!(bytes.len() % 8, 0);

    // every branch lands on instrumentation: each jump target symbol is
    // carried by an inserted instruction, not an original one
    for block in &blocks {
        let sym = block.insns[0].symbol();
        assert!(sym.is_some(), "block {} lost its symbol", block.index);
    }
}

#[test]
fn test_liveness_drives_register_choice() {
    // the merged state at the branch target mentions r0..r3, so the
    // trailer there must pick r4/r5
    let merged = merged_per_instruction(
        "4: R0=scalar() R1=scalar() R2=scalar() R3=scalar() R10=fp0\n\
         4: (95) exit\n",
    );

    let blocks = program_blocks(vec![
        Insn::mov64_imm(Reg::R0, 1).with_symbol("prog"),
        Insn::jeq_imm(Reg::R0, 0, 2),
        Insn::mov64_imm(Reg::R1, 0),
        Insn::exit(),
        Insn::exit(),
    ]);

    let mut params = std::collections::HashMap::new();
    params.insert("prog".to_string(), 1);

    let out =
        coverbee::instrument::instrument_program("prog", &blocks, &merged, &params, 0).unwrap();

    // find the trailer of the block starting at raw instruction 4: its
    // 16-bit counter load must use r4 as the counter and r5... the first
    // two free registers after r0..r3 and r10
    let ldxh = opcode::BPF_LDX | opcode::BPF_H | opcode::BPF_MEM;
    let target_load = out
        .iter()
        .filter(|i| i.opcode.0 == ldxh)
        .find(|i| i.offset == 4) // block 2's counter at byte offset 4
        .expect("trailer for the jump target block");
    assert_eq!(target_load.src, 4, "map value register skips live r0..r3");
    assert_eq!(target_load.dst, 5, "counter register skips live r0..r3");
}

#[test]
fn test_block_list_matches_counter_layout() {
    let blocks = program_blocks(vec![
        Insn::mov64_imm(Reg::R0, 1).with_symbol("prog"),
        Insn::jeq_imm(Reg::R0, 0, 1),
        Insn::exit(),
        Insn::exit(),
    ]);

    let block_list = cover::cfg_to_block_list(&blocks);
    assert_eq!(block_list.len(), blocks.len());

    // counters written by block id read back into the same position
    let mut with_counts = block_list;
    let mut value = Vec::new();
    for count in [5u16, 6, 7, 0] {
        value.extend_from_slice(&count.to_ne_bytes());
    }
    cover::apply_cover_map(&value, &mut with_counts).unwrap();
}
