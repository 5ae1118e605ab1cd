//! eBPF instruction model
//!
//! eBPF instructions are 64-bit fixed-length, encoded as:
//! ```text
//! opcode:8 src_reg:4 dst_reg:4 offset:16 imm:32
//! ```
//!
//! 64-bit immediate loads use two 64-bit slots. On top of the raw encoding,
//! instructions here carry two pieces of metadata that never reach the
//! kernel: a *symbol* naming the instruction as a jump target or function
//! entry, and a *reference* naming the symbol a jump or call lands on.
//! Branches are kept symbolic while the program is being rewritten;
//! [`resolve_references`] recomputes raw offsets just before encoding.

use std::fmt;

/// eBPF register identifiers (r0-r10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    /// Return value from functions, exit value for eBPF program
    R0 = 0,
    /// First argument to BPF helpers, also context pointer
    R1 = 1,
    /// Second argument to BPF helpers
    R2 = 2,
    /// Third argument to BPF helpers
    R3 = 3,
    /// Fourth argument to BPF helpers
    R4 = 4,
    /// Fifth argument to BPF helpers
    R5 = 5,
    /// Callee-saved register
    R6 = 6,
    /// Callee-saved register
    R7 = 7,
    /// Callee-saved register
    R8 = 8,
    /// Callee-saved register
    R9 = 9,
    /// Frame pointer (read-only)
    R10 = 10,
}

impl Reg {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(n: u8) -> Option<Reg> {
        match n {
            0 => Some(Reg::R0),
            1 => Some(Reg::R1),
            2 => Some(Reg::R2),
            3 => Some(Reg::R3),
            4 => Some(Reg::R4),
            5 => Some(Reg::R5),
            6 => Some(Reg::R6),
            7 => Some(Reg::R7),
            8 => Some(Reg::R8),
            9 => Some(Reg::R9),
            10 => Some(Reg::R10),
            _ => None,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.as_u8())
    }
}

/// BPF helper function numbers used by the instrumentation code.
///
/// See: https://man7.org/linux/man-pages/man7/bpf-helpers.7.html
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum BpfHelper {
    /// void *bpf_map_lookup_elem(map, key)
    MapLookupElem = 1,
    /// int bpf_map_update_elem(map, key, value, flags)
    MapUpdateElem = 2,
    /// int bpf_map_delete_elem(map, key)
    MapDeleteElem = 3,
}

/// eBPF instruction opcodes
pub mod opcode {
    // Instruction classes (3 bits)
    pub const BPF_LD: u8 = 0x00;
    pub const BPF_LDX: u8 = 0x01;
    pub const BPF_ST: u8 = 0x02;
    pub const BPF_STX: u8 = 0x03;
    pub const BPF_ALU: u8 = 0x04;
    pub const BPF_JMP: u8 = 0x05;
    pub const BPF_JMP32: u8 = 0x06;
    pub const BPF_ALU64: u8 = 0x07;

    // Size modifiers (2 bits)
    pub const BPF_W: u8 = 0x00; // 32-bit
    pub const BPF_H: u8 = 0x08; // 16-bit
    pub const BPF_B: u8 = 0x10; // 8-bit
    pub const BPF_DW: u8 = 0x18; // 64-bit

    // Source modifiers
    pub const BPF_K: u8 = 0x00; // Immediate
    pub const BPF_X: u8 = 0x08; // Register

    // ALU operations (upper 4 bits)
    pub const BPF_ADD: u8 = 0x00;
    pub const BPF_SUB: u8 = 0x10;
    pub const BPF_MUL: u8 = 0x20;
    pub const BPF_DIV: u8 = 0x30;
    pub const BPF_OR: u8 = 0x40;
    pub const BPF_AND: u8 = 0x50;
    pub const BPF_LSH: u8 = 0x60;
    pub const BPF_RSH: u8 = 0x70;
    pub const BPF_NEG: u8 = 0x80;
    pub const BPF_MOD: u8 = 0x90;
    pub const BPF_XOR: u8 = 0xa0;
    pub const BPF_MOV: u8 = 0xb0;
    pub const BPF_ARSH: u8 = 0xc0;

    // Jump operations (upper 4 bits)
    pub const BPF_JA: u8 = 0x00;
    pub const BPF_JEQ: u8 = 0x10;
    pub const BPF_JGT: u8 = 0x20;
    pub const BPF_JGE: u8 = 0x30;
    pub const BPF_JSET: u8 = 0x40;
    pub const BPF_JNE: u8 = 0x50;
    pub const BPF_JSGT: u8 = 0x60;
    pub const BPF_JSGE: u8 = 0x70;
    pub const BPF_CALL: u8 = 0x80;
    pub const BPF_EXIT: u8 = 0x90;
    pub const BPF_JLT: u8 = 0xa0;
    pub const BPF_JLE: u8 = 0xb0;
    pub const BPF_JSLT: u8 = 0xc0;
    pub const BPF_JSLE: u8 = 0xd0;

    // Memory modes
    pub const BPF_IMM: u8 = 0x00;
    pub const BPF_ABS: u8 = 0x20;
    pub const BPF_IND: u8 = 0x40;
    pub const BPF_MEM: u8 = 0x60;

    // Composite opcodes for common operations
    pub const MOV64_IMM: u8 = BPF_ALU64 | BPF_MOV | BPF_K; // 0xb7
    pub const MOV64_REG: u8 = BPF_ALU64 | BPF_MOV | BPF_X; // 0xbf
    pub const ADD64_IMM: u8 = BPF_ALU64 | BPF_ADD | BPF_K; // 0x07
    pub const CALL: u8 = BPF_JMP | BPF_CALL; // 0x85
    pub const EXIT: u8 = BPF_JMP | BPF_EXIT; // 0x95
    pub const LD_DW_IMM: u8 = BPF_LD | BPF_DW | BPF_IMM; // 0x18 (64-bit immediate load)
}

/// src_reg value marking a LD_DW_IMM as a map-fd load
pub const PSEUDO_MAP_FD: u8 = 1;
/// src_reg value marking a CALL as a bpf-to-bpf call
pub const PSEUDO_CALL: u8 = 1;

/// Jump operation extracted from an opcode. `Call` and `Exit` are included
/// even though they are not branches in the CFG sense; callers that only
/// care about real branches filter them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpOp {
    Ja,
    Jeq,
    Jgt,
    Jge,
    Jset,
    Jne,
    Jsgt,
    Jsge,
    Call,
    Exit,
    Jlt,
    Jle,
    Jslt,
    Jsle,
}

impl JumpOp {
    fn from_bits(bits: u8) -> Option<JumpOp> {
        match bits {
            opcode::BPF_JA => Some(JumpOp::Ja),
            opcode::BPF_JEQ => Some(JumpOp::Jeq),
            opcode::BPF_JGT => Some(JumpOp::Jgt),
            opcode::BPF_JGE => Some(JumpOp::Jge),
            opcode::BPF_JSET => Some(JumpOp::Jset),
            opcode::BPF_JNE => Some(JumpOp::Jne),
            opcode::BPF_JSGT => Some(JumpOp::Jsgt),
            opcode::BPF_JSGE => Some(JumpOp::Jsge),
            opcode::BPF_CALL => Some(JumpOp::Call),
            opcode::BPF_EXIT => Some(JumpOp::Exit),
            opcode::BPF_JLT => Some(JumpOp::Jlt),
            opcode::BPF_JLE => Some(JumpOp::Jle),
            opcode::BPF_JSLT => Some(JumpOp::Jslt),
            opcode::BPF_JSLE => Some(JumpOp::Jsle),
            _ => None,
        }
    }
}

/// A single eBPF opcode byte with derived classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u8);

impl Opcode {
    /// The 3-bit instruction class.
    pub const fn class(self) -> u8 {
        self.0 & 0x07
    }

    /// Jump operation, or `None` for non-jump classes.
    pub fn jump_op(self) -> Option<JumpOp> {
        match self.class() {
            opcode::BPF_JMP | opcode::BPF_JMP32 => JumpOp::from_bits(self.0 & 0xf0),
            _ => None,
        }
    }

    /// 64-bit immediate load, occupying two raw instruction slots.
    pub const fn is_dword_load(self) -> bool {
        self.0 == opcode::LD_DW_IMM
    }
}

/// Source file/line an instruction was compiled from, as recorded by BTF
/// line info. Drives the block-list output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub file: String,
    pub line: u32,
}

/// A single eBPF instruction plus rewrite metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Insn {
    /// Operation code
    pub opcode: Opcode,
    /// Destination register (4 bits)
    pub dst: u8,
    /// Source register (4 bits)
    pub src: u8,
    /// Signed offset for memory/branch operations
    pub offset: i16,
    /// Signed immediate value; 64 bits wide to hold a full dword-load value
    pub imm: i64,
    symbol: Option<String>,
    reference: Option<String>,
    /// Source line from BTF line info, if any
    pub line: Option<SourceLine>,
}

impl Insn {
    pub fn new(opcode: u8, dst: u8, src: u8, offset: i16, imm: i64) -> Self {
        Self {
            opcode: Opcode(opcode),
            dst,
            src,
            offset,
            imm,
            symbol: None,
            reference: None,
            line: None,
        }
    }

    /// Symbol naming this instruction as a jump target or function entry.
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn set_symbol(&mut self, symbol: Option<String>) {
        self.symbol = symbol;
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Symbol this instruction jumps or calls to.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn set_reference(&mut self, reference: Option<String>) {
        self.reference = reference;
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn jump_op(&self) -> Option<JumpOp> {
        self.opcode.jump_op()
    }

    pub fn is_dword_load(&self) -> bool {
        self.opcode.is_dword_load()
    }

    /// A bpf-to-bpf function call (as opposed to a helper call).
    pub fn is_function_call(&self) -> bool {
        self.opcode.0 == opcode::CALL && self.src == PSEUDO_CALL
    }

    /// A LD_DW_IMM whose immediate is patched to a map fd at load time.
    pub fn is_map_load(&self) -> bool {
        self.is_dword_load() && self.src == PSEUDO_MAP_FD
    }

    /// Number of raw 64-bit slots this instruction occupies.
    pub fn raw_slots(&self) -> u64 {
        if self.is_dword_load() {
            2
        } else {
            1
        }
    }

    // ===== Instruction builders =====

    /// MOV64 dst, imm
    pub fn mov64_imm(dst: Reg, imm: i32) -> Self {
        Self::new(opcode::MOV64_IMM, dst.as_u8(), 0, 0, imm as i64)
    }

    /// MOV64 dst, src
    pub fn mov64_reg(dst: Reg, src: Reg) -> Self {
        Self::new(opcode::MOV64_REG, dst.as_u8(), src.as_u8(), 0, 0)
    }

    /// ADD64 dst, imm
    pub fn add64_imm(dst: Reg, imm: i32) -> Self {
        Self::new(opcode::ADD64_IMM, dst.as_u8(), 0, 0, imm as i64)
    }

    /// LDXDW dst, [src+off] - Load 64-bit value from memory
    pub fn ldxdw(dst: Reg, src: Reg, offset: i16) -> Self {
        Self::new(
            opcode::BPF_LDX | opcode::BPF_DW | opcode::BPF_MEM,
            dst.as_u8(),
            src.as_u8(),
            offset,
            0,
        )
    }

    /// LDXH dst, [src+off] - Load 16-bit value from memory
    pub fn ldxh(dst: Reg, src: Reg, offset: i16) -> Self {
        Self::new(
            opcode::BPF_LDX | opcode::BPF_H | opcode::BPF_MEM,
            dst.as_u8(),
            src.as_u8(),
            offset,
            0,
        )
    }

    /// STXDW [dst+off], src - Store 64-bit value from register
    pub fn stxdw(dst: Reg, offset: i16, src: Reg) -> Self {
        Self::new(
            opcode::BPF_STX | opcode::BPF_DW | opcode::BPF_MEM,
            dst.as_u8(),
            src.as_u8(),
            offset,
            0,
        )
    }

    /// STXH [dst+off], src - Store 16-bit value from register
    pub fn stxh(dst: Reg, offset: i16, src: Reg) -> Self {
        Self::new(
            opcode::BPF_STX | opcode::BPF_H | opcode::BPF_MEM,
            dst.as_u8(),
            src.as_u8(),
            offset,
            0,
        )
    }

    /// STDW [dst+off], imm - Store 64-bit immediate to memory
    pub fn st_imm_dw(dst: Reg, offset: i16, imm: i32) -> Self {
        Self::new(
            opcode::BPF_ST | opcode::BPF_DW | opcode::BPF_MEM,
            dst.as_u8(),
            0,
            offset,
            imm as i64,
        )
    }

    /// JNE dst, imm, offset - Jump if dst != imm
    pub fn jne_imm(dst: Reg, imm: i32, offset: i16) -> Self {
        Self::new(
            opcode::BPF_JMP | opcode::BPF_JNE | opcode::BPF_K,
            dst.as_u8(),
            0,
            offset,
            imm as i64,
        )
    }

    /// JEQ dst, imm, offset - Jump if dst == imm
    pub fn jeq_imm(dst: Reg, imm: i32, offset: i16) -> Self {
        Self::new(
            opcode::BPF_JMP | opcode::BPF_JEQ | opcode::BPF_K,
            dst.as_u8(),
            0,
            offset,
            imm as i64,
        )
    }

    /// JA offset - Unconditional jump
    pub fn ja(offset: i16) -> Self {
        Self::new(opcode::BPF_JMP | opcode::BPF_JA, 0, 0, offset, 0)
    }

    /// CALL helper - Call a BPF helper function
    pub fn call_helper(helper: BpfHelper) -> Self {
        Self::new(opcode::CALL, 0, 0, 0, helper as u32 as i64)
    }

    /// EXIT - Exit the program (return value in r0)
    pub fn exit() -> Self {
        Self::new(opcode::EXIT, 0, 0, 0, 0)
    }

    /// LD_MAP_PTR dst, map - Load a map pointer by symbolic reference.
    ///
    /// The immediate is patched with the map fd at load time; until then the
    /// map is identified by the reference. Occupies two raw slots.
    pub fn ld_map_ptr(dst: Reg, map: impl Into<String>) -> Self {
        Self::new(opcode::LD_DW_IMM, dst.as_u8(), PSEUDO_MAP_FD, 0, 0).with_reference(map)
    }

    /// Encode into raw 8-byte slots, appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut slot = [0u8; 8];
        slot[0] = self.opcode.0;
        slot[1] = (self.src << 4) | (self.dst & 0x0f);
        slot[2..4].copy_from_slice(&self.offset.to_le_bytes());
        slot[4..8].copy_from_slice(&(self.imm as u32 as i32).to_le_bytes());
        out.extend_from_slice(&slot);

        if self.is_dword_load() {
            let mut hi = [0u8; 8];
            hi[4..8].copy_from_slice(&(((self.imm as u64) >> 32) as u32).to_le_bytes());
            out.extend_from_slice(&hi);
        }
    }
}

/// Raw-slot offset of every instruction in a sequence. Dword loads advance
/// the offset by two.
pub fn raw_offsets(insns: &[Insn]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(insns.len());
    let mut off = 0u64;
    for insn in insns {
        offsets.push(off);
        off += insn.raw_slots();
    }
    offsets
}

#[derive(Debug, thiserror::Error)]
pub enum InsnError {
    #[error("reference to unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("branch from {from} to '{symbol}' does not fit in a 16-bit offset")]
    BranchOutOfRange { from: u64, symbol: String },
}

/// Recompute raw branch offsets and call immediates from symbol positions.
///
/// Jumps carrying a reference get `offset = target - self - 1`; bpf-to-bpf
/// calls get the same value in `imm`. Map loads keep their reference; their
/// immediate is the map fd and is patched separately.
pub fn resolve_references(insns: &mut [Insn]) -> Result<(), InsnError> {
    let offsets = raw_offsets(insns);

    let mut sym_to_off = std::collections::HashMap::new();
    for (i, insn) in insns.iter().enumerate() {
        if let Some(sym) = insn.symbol() {
            sym_to_off.insert(sym.to_string(), offsets[i]);
        }
    }

    for (i, insn) in insns.iter_mut().enumerate() {
        let Some(op) = insn.jump_op() else { continue };

        let Some(reference) = insn.reference() else {
            continue;
        };

        let target = *sym_to_off
            .get(reference)
            .ok_or_else(|| InsnError::UnknownSymbol(reference.to_string()))?;
        let rel = target as i64 - offsets[i] as i64 - 1;

        match op {
            JumpOp::Call => {
                if insn.is_function_call() {
                    insn.imm = rel;
                }
            }
            JumpOp::Exit => {}
            _ => {
                insn.offset = i16::try_from(rel).map_err(|_| InsnError::BranchOutOfRange {
                    from: offsets[i],
                    symbol: reference.to_string(),
                })?;
            }
        }
    }

    Ok(())
}

/// Encode a whole program into the byte stream handed to the kernel.
pub fn encode_program(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * 8);
    for insn in insns {
        insn.encode_into(&mut out);
    }
    out
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sym) = self.symbol() {
            writeln!(f, "{sym}:")?;
        }

        let dst = self.dst;
        let src = self.src;
        let class = self.opcode.class();
        match class {
            opcode::BPF_ALU | opcode::BPF_ALU64 => {
                let op = match self.opcode.0 & 0xf0 {
                    opcode::BPF_ADD => "+=",
                    opcode::BPF_SUB => "-=",
                    opcode::BPF_MUL => "*=",
                    opcode::BPF_DIV => "/=",
                    opcode::BPF_OR => "|=",
                    opcode::BPF_AND => "&=",
                    opcode::BPF_LSH => "<<=",
                    opcode::BPF_RSH => ">>=",
                    opcode::BPF_MOD => "%=",
                    opcode::BPF_XOR => "^=",
                    opcode::BPF_MOV => "=",
                    opcode::BPF_ARSH => "s>>=",
                    _ => return write!(f, "\t(op {:#04x})", self.opcode.0),
                };
                if self.opcode.0 & opcode::BPF_X != 0 {
                    write!(f, "\tr{dst} {op} r{src}")
                } else {
                    write!(f, "\tr{dst} {op} {}", self.imm)
                }
            }
            opcode::BPF_LD => {
                if self.is_dword_load() {
                    match self.reference() {
                        Some(map) => write!(f, "\tr{dst} = map[{map}]"),
                        None => write!(f, "\tr{dst} = {:#x} ll", self.imm),
                    }
                } else {
                    write!(f, "\t(ld {:#04x})", self.opcode.0)
                }
            }
            opcode::BPF_LDX => write!(f, "\tr{dst} = *({})(r{src} {:+})", size_name(self.opcode.0), self.offset),
            opcode::BPF_ST => write!(
                f,
                "\t*({})(r{dst} {:+}) = {}",
                size_name(self.opcode.0),
                self.offset,
                self.imm
            ),
            opcode::BPF_STX => write!(
                f,
                "\t*({})(r{dst} {:+}) = r{src}",
                size_name(self.opcode.0),
                self.offset
            ),
            opcode::BPF_JMP | opcode::BPF_JMP32 => match self.jump_op() {
                Some(JumpOp::Exit) => write!(f, "\texit"),
                Some(JumpOp::Call) => match self.reference() {
                    Some(func) if self.is_function_call() => write!(f, "\tcall {func}"),
                    _ => write!(f, "\tcall #{}", self.imm),
                },
                Some(JumpOp::Ja) => match self.reference() {
                    Some(label) => write!(f, "\tgoto {label}"),
                    None => write!(f, "\tgoto {:+}", self.offset),
                },
                Some(op) => {
                    let cmp = match op {
                        JumpOp::Jeq => "==",
                        JumpOp::Jgt => ">",
                        JumpOp::Jge => ">=",
                        JumpOp::Jset => "&",
                        JumpOp::Jne => "!=",
                        JumpOp::Jsgt => "s>",
                        JumpOp::Jsge => "s>=",
                        JumpOp::Jlt => "<",
                        JumpOp::Jle => "<=",
                        JumpOp::Jslt => "s<",
                        JumpOp::Jsle => "s<=",
                        JumpOp::Ja | JumpOp::Call | JumpOp::Exit => unreachable!(),
                    };
                    let target = match self.reference() {
                        Some(label) => label.to_string(),
                        None => format!("{:+}", self.offset),
                    };
                    if self.opcode.0 & opcode::BPF_X != 0 {
                        write!(f, "\tif r{dst} {cmp} r{src} goto {target}")
                    } else {
                        write!(f, "\tif r{dst} {cmp} {} goto {target}", self.imm)
                    }
                }
                None => write!(f, "\t(jmp {:#04x})", self.opcode.0),
            },
            _ => write!(f, "\t(op {:#04x})", self.opcode.0),
        }
    }
}

fn size_name(op: u8) -> &'static str {
    match op & 0x18 {
        opcode::BPF_W => "u32",
        opcode::BPF_H => "u16",
        opcode::BPF_B => "u8",
        _ => "u64",
    }
}

#[cfg(test)]
mod tests;
