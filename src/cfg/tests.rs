use super::*;
use crate::insn::Reg;

fn entry(insn: Insn) -> Insn {
    insn.with_symbol("prog")
}

#[test]
fn test_three_block_split() {
    // 0: mov r0, 1
    // 1: if r0 == 1 goto +2
    // 2: mov r1, 2
    // 3: exit
    // 4: mov r1, 3     <- jump target
    // 5: exit
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R0, 1)),
        Insn::jeq_imm(Reg::R0, 1, 2),
        Insn::mov64_imm(Reg::R1, 2),
        Insn::exit(),
        Insn::mov64_imm(Reg::R1, 3),
        Insn::exit(),
    ]);

    assert_eq!(blocks.len(), 3);

    // block 0: conditional jump at the end, both successors
    assert_eq!(blocks[0].insns.len(), 2);
    assert_eq!(blocks[0].no_branch, Some(1));
    assert_eq!(blocks[0].branch, Some(2));

    // blocks 1 and 2 end in exit: no successors
    assert_eq!(blocks[1].no_branch, None);
    assert_eq!(blocks[1].branch, None);
    assert_eq!(blocks[2].no_branch, None);
    assert_eq!(blocks[2].branch, None);

    // the jump target got a synthesized label
    assert_eq!(blocks[2].symbol(), Some("j-4"));

    // the jump itself now references the label symbolically
    let jump = blocks[0].insns.last().unwrap();
    assert_eq!(jump.reference(), Some("j-4"));
    assert_eq!(jump.offset, -1);
}

#[test]
fn test_dword_load_shifts_raw_offsets() {
    // 0: r1 = map[m]  (two raw slots: 0-1)
    // 1: if r1 == 0 goto +1   (raw 2)
    // 2: mov r0, 0            (raw 3)
    // 3: exit                 (raw 4) <- target of the jump (raw 2+1+1)
    let blocks = program_blocks(vec![
        entry(Insn::ld_map_ptr(Reg::R1, "m")),
        Insn::jeq_imm(Reg::R1, 0, 1),
        Insn::mov64_imm(Reg::R0, 0),
        Insn::exit(),
    ]);

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[2].symbol(), Some("j-4"));
    assert_eq!(blocks[0].branch, Some(2));
}

#[test]
fn test_unconditional_jump_has_only_branch_edge() {
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R0, 0)),
        Insn::ja(1),
        Insn::mov64_imm(Reg::R0, 1),
        Insn::exit(),
    ]);

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].no_branch, None);
    assert_eq!(blocks[0].branch, Some(2));
}

#[test]
fn test_call_has_fall_through_but_no_branch() {
    let call = Insn::new(crate::insn::opcode::CALL, 0, crate::insn::PSEUDO_CALL, 0, -1)
        .with_reference("sub");
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R1, 1)),
        call,
        Insn::exit(),
        Insn::mov64_imm(Reg::R0, 0).with_symbol("sub"),
        Insn::exit(),
    ]);

    assert_eq!(blocks.len(), 3);
    // the call block falls through to the return point, branch is unset even
    // though the callee has a symbol-bearing block
    assert_eq!(blocks[0].no_branch, Some(1));
    assert_eq!(blocks[0].branch, None);
    assert_eq!(blocks[2].symbol(), Some("sub"));
}

#[test]
fn test_jump_to_function_entry_reuses_symbol() {
    // a backward jump targeting an instruction that already carries a symbol
    // must reference that symbol instead of renaming it
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R0, 0)),
        Insn::mov64_imm(Reg::R1, 1).with_symbol("loop_top"),
        Insn::jeq_imm(Reg::R0, 0, -2),
        Insn::exit(),
    ]);

    assert_eq!(blocks[0].symbol(), Some("prog"));
    assert_eq!(blocks[1].symbol(), Some("loop_top"));
    let jump = blocks[1].insns.last().unwrap();
    assert_eq!(jump.reference(), Some("loop_top"));
    assert_eq!(blocks[1].branch, Some(1));
}

#[test]
fn test_symbols_are_unique_across_blocks() {
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R0, 1)),
        Insn::jeq_imm(Reg::R0, 1, 2),
        Insn::mov64_imm(Reg::R1, 2),
        Insn::exit(),
        Insn::mov64_imm(Reg::R1, 3),
        Insn::exit(),
    ]);

    let mut seen = std::collections::HashSet::new();
    for block in &blocks {
        let sym = block.symbol().expect("every block starts with a symbol");
        assert!(seen.insert(sym.to_string()), "duplicate symbol {sym}");
    }

    // every branching instruction's reference resolves to exactly one block
    for block in &blocks {
        let last = block.insns.last().unwrap();
        if let Some(label) = last.reference() {
            let matches = blocks
                .iter()
                .filter(|b| b.symbol() == Some(label))
                .count();
            assert_eq!(matches, 1, "reference {label} resolves to {matches} blocks");
        }
    }
}

#[test]
fn test_only_first_instruction_bears_symbol() {
    let blocks = program_blocks(vec![
        entry(Insn::mov64_imm(Reg::R0, 1)),
        Insn::jeq_imm(Reg::R0, 1, 1),
        Insn::mov64_imm(Reg::R1, 2),
        Insn::exit(),
    ]);

    for block in &blocks {
        assert!(!block.insns.is_empty());
        for insn in &block.insns[1..] {
            assert!(insn.symbol().is_none());
        }
    }
}
