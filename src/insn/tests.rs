use super::*;

#[test]
fn test_mov64_imm_encoding() {
    let mut out = Vec::new();
    Insn::mov64_imm(Reg::R1, 42).encode_into(&mut out);
    // opcode=0xb7, regs=0x01 (dst=1), offset=0x0000, imm=42
    assert_eq!(out, [0xb7, 0x01, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00]);
}

#[test]
fn test_exit_encoding() {
    let mut out = Vec::new();
    Insn::exit().encode_into(&mut out);
    assert_eq!(out, [0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_call_helper_encoding() {
    let mut out = Vec::new();
    Insn::call_helper(BpfHelper::MapLookupElem).encode_into(&mut out);
    // opcode=0x85, imm=1 (bpf_map_lookup_elem)
    assert_eq!(out, [0x85, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn test_stxh_encoding() {
    let mut out = Vec::new();
    Insn::stxh(Reg::R8, 4, Reg::R9).encode_into(&mut out);
    // opcode = BPF_STX | BPF_H | BPF_MEM = 0x6b, regs = src<<4 | dst = 0x98
    assert_eq!(out, [0x6b, 0x98, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_dword_load_uses_two_slots() {
    let mut insn = Insn::ld_map_ptr(Reg::R1, "coverbee_covermap");
    insn.imm = 0x1_0000_0007;
    assert_eq!(insn.raw_slots(), 2);

    let mut out = Vec::new();
    insn.encode_into(&mut out);
    assert_eq!(out.len(), 16);
    // low half in first slot's imm, high half in second slot's imm
    assert_eq!(&out[4..8], &7i32.to_le_bytes());
    assert_eq!(&out[12..16], &1i32.to_le_bytes());
    // src_reg nibble marks the pseudo map load
    assert_eq!(out[1] >> 4, PSEUDO_MAP_FD);
}

#[test]
fn test_raw_offsets_account_for_dword_loads() {
    let insns = vec![
        Insn::mov64_imm(Reg::R0, 0),
        Insn::ld_map_ptr(Reg::R1, "m"),
        Insn::exit(),
    ];
    assert_eq!(raw_offsets(&insns), vec![0, 1, 3]);
}

#[test]
fn test_jump_op_classification() {
    assert_eq!(Insn::exit().jump_op(), Some(JumpOp::Exit));
    assert_eq!(Insn::ja(3).jump_op(), Some(JumpOp::Ja));
    assert_eq!(Insn::jne_imm(Reg::R0, 0, 2).jump_op(), Some(JumpOp::Jne));
    assert_eq!(Insn::mov64_imm(Reg::R0, 0).jump_op(), None);
    assert_eq!(
        Insn::call_helper(BpfHelper::MapLookupElem).jump_op(),
        Some(JumpOp::Call)
    );
    assert!(!Insn::call_helper(BpfHelper::MapLookupElem).is_function_call());
}

#[test]
fn test_resolve_references_recomputes_offsets() {
    // 0: if r0 == 1 goto target   (raw 0)
    // 1: r1 = map[m] (dword)      (raw 1..2)
    // 2: exit                     (raw 3)
    // 3: target: r0 = 0           (raw 4)
    // 4: exit                     (raw 5)
    let mut insns = vec![
        Insn::jeq_imm(Reg::R0, 1, -1).with_reference("target"),
        Insn::ld_map_ptr(Reg::R1, "m"),
        Insn::exit(),
        Insn::mov64_imm(Reg::R0, 0).with_symbol("target"),
        Insn::exit(),
    ];
    resolve_references(&mut insns).unwrap();
    // target raw offset 4, jump at raw 0: 4 - 0 - 1 = 3
    assert_eq!(insns[0].offset, 3);
}

#[test]
fn test_resolve_references_patches_calls() {
    let mut call = Insn::new(opcode::CALL, 0, PSEUDO_CALL, 0, -1).with_reference("sub");
    call.set_symbol(Some("main".into()));
    let mut insns = vec![
        call,
        Insn::exit(),
        Insn::mov64_imm(Reg::R0, 0).with_symbol("sub"),
        Insn::exit(),
    ];
    resolve_references(&mut insns).unwrap();
    assert_eq!(insns[0].imm, 1);
}

#[test]
fn test_resolve_references_unknown_symbol() {
    let mut insns = vec![Insn::ja(-1).with_reference("nowhere"), Insn::exit()];
    let err = resolve_references(&mut insns).unwrap_err();
    assert!(matches!(err, InsnError::UnknownSymbol(sym) if sym == "nowhere"));
}
