use super::*;
use crate::cfg::program_blocks;
use crate::elf::ProgramSpec;
use crate::insn::{opcode, resolve_references, Reg};

const LDXDW: u8 = opcode::BPF_LDX | opcode::BPF_DW | opcode::BPF_MEM;
const LDXH: u8 = opcode::BPF_LDX | opcode::BPF_H | opcode::BPF_MEM;
const STXDW: u8 = opcode::BPF_STX | opcode::BPF_DW | opcode::BPF_MEM;
const STXH: u8 = opcode::BPF_STX | opcode::BPF_H | opcode::BPF_MEM;

fn state(text: &str) -> VerifierState {
    VerifierState::parse(text)
}

fn params(entries: &[(&str, usize)]) -> HashMap<String, usize> {
    entries
        .iter()
        .map(|(name, count)| (name.to_string(), *count))
        .collect()
}

/// Single-block single-argument program: `mov r0, 0; exit`.
fn single_block_program() -> Vec<crate::insn::Insn> {
    vec![
        Insn::mov64_imm(Reg::R0, 0).with_symbol("prog"),
        Insn::exit(),
    ]
}

#[test]
fn test_stack_layout_above_high_water_mark() {
    let merged = vec![state("R1=ctx(off=0,imm=0) R10=fp0 fp-8=mmmmmmmm fp-48=mmmmmmmm")];
    let layout = StackLayout::from_merged(&merged);
    assert_eq!(layout.cover_map, 56);
    assert_eq!(layout.reg_save1, 64);
    assert_eq!(layout.reg_save2, 72);
}

#[test]
fn test_stack_layout_for_stackless_program() {
    let merged = vec![state("R0=scalar() R1=ctx(off=0,imm=0) R10=fp0")];
    let layout = StackLayout::from_merged(&merged);
    assert_eq!(layout.cover_map, 8);
    assert_eq!(layout.reg_save1, 16);
    assert_eq!(layout.reg_save2, 24);
}

#[test]
fn test_single_block_prologue_and_trailer() {
    let blocks = program_blocks(single_block_program());
    // r0, r1 and r10 appear in the exploration; r2..r9 are free
    let merged = vec![
        state("R0_w=scalar() R1=ctx(off=0,imm=0) R10=fp0"),
        state("R0_w=scalar() R1=ctx(off=0,imm=0) R10=fp0"),
    ];

    let out = instrument_program("prog", &blocks, &merged, &params(&[("prog", 1)]), 0).unwrap();

    // exactly one map lookup: the prologue's
    let lookups = out
        .iter()
        .filter(|i| i.opcode.0 == opcode::CALL && i.src == 0 && i.imm == 1)
        .count();
    assert_eq!(lookups, 1);

    // the trailer picks the first two free registers, r2 and r3
    let counter_load = out
        .iter()
        .find(|i| i.opcode.0 == LDXH)
        .expect("counter load emitted");
    assert_eq!(counter_load.dst, 2 + 1); // counter in r3
    assert_eq!(counter_load.src, 2); // map value in r2
    assert_eq!(counter_load.offset, 0); // block 0 counter

    // map value pointer comes from the reserved slot
    let map_load = out
        .iter()
        .find(|i| i.opcode.0 == LDXDW && i.dst == 2)
        .expect("map value load emitted");
    assert_eq!(map_load.offset, -8);

    // the counter is written back as a 16-bit store
    assert!(out.iter().any(|i| i.opcode.0 == STXH && i.dst == 2));
}

#[test]
fn test_symbol_migrates_to_instrumentation() {
    let blocks = program_blocks(single_block_program());
    let merged = vec![state("R1=ctx(off=0,imm=0) R10=fp0")];

    let out = instrument_program("prog", &blocks, &merged, &params(&[("prog", 1)]), 0).unwrap();

    // the program symbol now sits on the first inserted instruction
    assert_eq!(out[0].symbol(), Some("prog"));

    // the original first instruction lost it: exactly one instruction in
    // the rewritten program carries the program symbol
    assert_eq!(
        out.iter().filter(|i| i.symbol() == Some("prog")).count(),
        1
    );
    assert!(out.last().unwrap().symbol().is_none());
}

#[test]
fn test_unexplored_block_spills_both_registers() {
    // two blocks; the verifier log only covers the first one
    let blocks = program_blocks(vec![
        Insn::mov64_imm(Reg::R0, 1).with_symbol("prog"),
        Insn::jeq_imm(Reg::R0, 0, 1),
        Insn::exit(),
        Insn::exit(),
    ]);
    let merged = vec![
        state("R0_w=scalar() R1=ctx(off=0,imm=0) R10=fp0"),
        state("R0_w=scalar() R1=ctx(off=0,imm=0) R10=fp0"),
    ];

    let out = instrument_program("prog", &blocks, &merged, &params(&[("prog", 1)]), 0).unwrap();

    // the unexplored blocks must not clobber anything: r8/r9 are spilled to
    // the save slots and restored afterwards
    let spills: Vec<_> = out
        .iter()
        .filter(|i| i.opcode.0 == STXDW && i.dst == 10 && (i.src == 8 || i.src == 9))
        .collect();
    assert!(
        spills.iter().any(|i| i.src == 8 && i.offset == -16),
        "r8 spilled to the first save slot"
    );
    assert!(
        spills.iter().any(|i| i.src == 9 && i.offset == -24),
        "r9 spilled to the second save slot"
    );

    let restores: Vec<_> = out
        .iter()
        .filter(|i| i.opcode.0 == LDXDW && i.src == 10 && (i.offset == -16 || i.offset == -24))
        .collect();
    assert_eq!(spills.len(), restores.len(), "spills and restores balance");
}

#[test]
fn test_five_argument_prologue_parks_r5_on_stack() {
    let blocks = program_blocks(single_block_program());
    let merged = vec![state("R1=scalar() R2=scalar() R3=scalar() R4=scalar() R5=scalar() R10=fp0")];

    let out = instrument_program("prog", &blocks, &merged, &params(&[("prog", 5)]), 0).unwrap();

    // r5 goes to the second save slot, r1-r4 park in r6-r9
    assert!(out
        .iter()
        .any(|i| i.opcode.0 == STXDW && i.dst == 10 && i.src == 5 && i.offset == -24));
    for arg in 1..=4u8 {
        assert!(out
            .iter()
            .any(|i| i.opcode.0 == opcode::MOV64_REG && i.dst == arg + 5 && i.src == arg));
        assert!(out
            .iter()
            .any(|i| i.opcode.0 == opcode::MOV64_REG && i.dst == arg && i.src == arg + 5));
    }
    assert!(out
        .iter()
        .any(|i| i.opcode.0 == LDXDW && i.dst == 5 && i.src == 10 && i.offset == -24));
}

#[test]
fn test_missing_function_metadata_fails_program() {
    let blocks = program_blocks(single_block_program());
    let merged = vec![state("R1=ctx(off=0,imm=0) R10=fp0")];

    let err = instrument_program("prog", &blocks, &merged, &HashMap::new(), 0).unwrap_err();
    assert!(matches!(
        err,
        InstrumentError::MissingFuncInfo { func, .. } if func == "prog"
    ));
}

#[test]
fn test_sub_program_entry_gets_prologue() {
    let call = Insn::new(opcode::CALL, 0, crate::insn::PSEUDO_CALL, 0, -1).with_reference("sub");
    let blocks = program_blocks(vec![
        Insn::mov64_imm(Reg::R1, 7).with_symbol("prog"),
        call,
        Insn::exit(),
        Insn::mov64_imm(Reg::R0, 0).with_symbol("sub"),
        Insn::exit(),
    ]);
    let merged = vec![state("R1=ctx(off=0,imm=0) R10=fp0")];

    let out = instrument_program(
        "prog",
        &blocks,
        &merged,
        &params(&[("prog", 1), ("sub", 2)]),
        0,
    )
    .unwrap();

    // two prologues means two map lookups
    let lookups = out
        .iter()
        .filter(|i| i.opcode.0 == opcode::CALL && i.src == 0 && i.imm == 1)
        .count();
    assert_eq!(lookups, 2);

    // the callee symbol moved onto its prologue, and the call still resolves
    assert_eq!(
        out.iter().filter(|i| i.symbol() == Some("sub")).count(),
        1
    );
    let mut resolved = out.clone();
    resolve_references(&mut resolved).expect("all references resolve after instrumentation");
}

#[test]
fn test_counter_offsets_respect_block_id_base() {
    let blocks = program_blocks(vec![
        Insn::mov64_imm(Reg::R0, 1).with_symbol("prog"),
        Insn::jeq_imm(Reg::R0, 0, 1),
        Insn::exit(),
        Insn::exit(),
    ]);
    let merged = vec![state("R0=scalar() R1=ctx(off=0,imm=0) R10=fp0")];

    let out = instrument_program("prog", &blocks, &merged, &params(&[("prog", 1)]), 3).unwrap();

    let mut offsets: Vec<i16> = out
        .iter()
        .filter(|i| i.opcode.0 == LDXH)
        .map(|i| i.offset)
        .collect();
    offsets.sort_unstable();
    // blocks 3, 4 and 5 -> counter bytes 6, 8 and 10
    assert_eq!(offsets, vec![6, 8, 10]);
}

#[test]
fn test_instrument_collection_registers_cover_map() {
    let mut spec = CollectionSpec {
        license: "GPL".to_string(),
        ..CollectionSpec::default()
    };
    spec.programs.insert(
        "prog".to_string(),
        ProgramSpec {
            name: "prog".to_string(),
            section: "xdp".to_string(),
            prog_type: crate::elf::ProgType::Xdp,
            insns: single_block_program(),
            func_params: params(&[("prog", 1)]),
        },
    );

    let mut logs = BTreeMap::new();
    logs.insert(
        "prog".to_string(),
        "0: R1=ctx(off=0,imm=0) R10=fp0\n0: (b7) r0 = 0; R0_w=0\n1: (95) exit\n".to_string(),
    );

    let blocks = instrument_collection(&mut spec, &logs, None).unwrap();
    assert_eq!(blocks.len(), 1);

    let cover = spec.maps.get(COVER_MAP_NAME).expect("covermap registered");
    assert_eq!(cover.key_size, 4);
    assert_eq!(cover.max_entries, 1);
    assert_eq!(cover.value_size, 2 * (blocks.len() as u32 + 1));

    // the program was rewritten in place
    let prog = &spec.programs["prog"];
    assert!(prog.insns.len() > 2);
    assert_eq!(prog.insns[0].symbol(), Some("prog"));
}
