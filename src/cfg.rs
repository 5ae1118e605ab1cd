//! Control-flow graph over raw eBPF instruction streams.
//!
//! Blocks are split on jump-target symbols and on branching instructions,
//! then linked along fall-through and branch edges. Jump targets are turned
//! into symbolic references first, so instructions can be inserted into
//! blocks later without breaking branch offsets; the final offsets are
//! recomputed from symbols when the program is encoded.
//!
//! Blocks live in an arena indexed by position. Edges are indices into that
//! arena, which keeps loops representable without reference cycles.

use crate::insn::{raw_offsets, Insn, JumpOp};

/// One basic block: a maximal straight-line run of instructions.
///
/// The first instruction always carries a symbol, either a function name or
/// a synthesized `j-<raw-offset>` jump label.
#[derive(Debug, Clone, Default)]
pub struct ProgBlock {
    /// Position of this block within the program's block list.
    pub index: usize,
    /// The instructions making up the block.
    pub insns: Vec<Insn>,
    /// Next block when the final branch is not taken (or the block does not
    /// branch). `None` after an exit or an unconditional jump.
    pub no_branch: Option<usize>,
    /// Next block when the final branch is taken. `None` unless the block
    /// ends in a conditional or unconditional jump.
    pub branch: Option<usize>,
}

impl ProgBlock {
    /// The symbol of the block's first instruction.
    pub fn symbol(&self) -> Option<&str> {
        self.insns.first().and_then(|insn| insn.symbol())
    }
}

/// Whether an instruction ends a basic block, and how it links onward.
fn block_edges(op: JumpOp) -> (bool, bool) {
    // (has fall-through, has branch edge)
    match op {
        JumpOp::Exit => (false, false),
        JumpOp::Ja => (false, true),
        JumpOp::Call => (true, false),
        _ => (true, true),
    }
}

/// Convert an instruction stream into a list of linked basic blocks.
///
/// Works in four steps:
/// 1. Build a raw-offset lookup (dword immediate loads occupy two slots).
/// 2. Label every jump target with a `j-<raw-offset>` symbol and rewrite the
///    jump to reference it, with a numeric offset of -1 meaning "resolved
///    symbolically". Targets that already carry a symbol keep it, and the
///    jump references the existing symbol instead.
/// 3. Split the stream into blocks at symbols and after branching
///    instructions.
/// 4. Link blocks: fall-through to the next block, branch to the block whose
///    first instruction carries the referenced symbol.
pub fn program_blocks(mut insns: Vec<Insn>) -> Vec<ProgBlock> {
    let offsets = raw_offsets(&insns);

    let mut off_to_idx = std::collections::HashMap::new();
    for (idx, off) in offsets.iter().enumerate() {
        off_to_idx.insert(*off, idx);
    }

    // Step 2: symbolize jump targets. Calls and exits are left alone; call
    // references name functions, not blocks.
    let mut jumps = Vec::new();
    for (idx, insn) in insns.iter().enumerate() {
        match insn.jump_op() {
            None | Some(JumpOp::Call) | Some(JumpOp::Exit) => continue,
            Some(_) => {}
        }
        let target = offsets[idx].wrapping_add_signed(insn.offset as i64 + 1);
        jumps.push((idx, target));
    }

    for (idx, target) in jumps {
        let Some(&target_idx) = off_to_idx.get(&target) else {
            continue;
        };

        let label = match insns[target_idx].symbol() {
            Some(existing) => existing.to_string(),
            None => {
                let label = format!("j-{target}");
                insns[target_idx].set_symbol(Some(label.clone()));
                label
            }
        };

        insns[idx].offset = -1;
        insns[idx].set_reference(Some(label));
    }

    // Step 3: split into blocks.
    let mut blocks: Vec<ProgBlock> = Vec::new();
    let mut current = ProgBlock::default();

    for insn in insns {
        if insn.symbol().is_some() && !current.insns.is_empty() {
            let next = current.index + 1;
            current.no_branch = Some(next);
            blocks.push(std::mem::take(&mut current));
            current.index = next;
        }

        let op = insn.jump_op();
        current.insns.push(insn);

        let Some(op) = op else { continue };

        let next = current.index + 1;
        let (fall_through, _) = block_edges(op);
        if fall_through {
            current.no_branch = Some(next);
        }
        blocks.push(std::mem::take(&mut current));
        current.index = next;
    }

    if !current.insns.is_empty() {
        blocks.push(current);
    }

    // A trailing fall-through may point past the last block when the program
    // ends on a non-exit instruction.
    let count = blocks.len();
    for block in &mut blocks {
        if block.no_branch.is_some_and(|next| next >= count) {
            block.no_branch = None;
        }
    }

    // Step 4: link branch edges through symbols.
    let mut sym_to_block = std::collections::HashMap::new();
    for block in &blocks {
        if let Some(sym) = block.symbol() {
            sym_to_block.insert(sym.to_string(), block.index);
        }
    }

    for block in &mut blocks {
        let Some(last) = block.insns.last() else { continue };
        match last.jump_op() {
            None | Some(JumpOp::Call) | Some(JumpOp::Exit) => continue,
            Some(_) => {}
        }
        block.branch = last
            .reference()
            .and_then(|label| sym_to_block.get(label))
            .copied();
    }

    blocks
}

#[cfg(test)]
mod tests;
