//! Basic-block counter instrumentation.
//!
//! Each block gets a short trailer that increments a 16-bit counter at
//! offset `2 * block-id` inside the coverage map's single value. Function
//! entries additionally get a prologue that looks the map value up once and
//! parks the pointer on the stack for the lifetime of the frame.
//!
//! The inserted code must not disturb the original program: it only uses
//! registers the verifier never mentioned at the block's first instruction,
//! and falls back to spilling `r8`/`r9` into reserved stack slots above the
//! program's own high-water mark when no dead register exists.
//!
//! The counter update is a plain load-add-store. Concurrent executions on
//! other CPUs can lose increments, so counts are lower bounds under
//! contention.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;

use crate::cfg::{program_blocks, ProgBlock};
use crate::elf::{CollectionSpec, MapSpec};
use crate::insn::{BpfHelper, Insn, Reg};
use crate::verifier_log::{merged_per_instruction, VerifierState};

/// Name of the single array map holding the per-block counters.
pub const COVER_MAP_NAME: &str = "coverbee_covermap";

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("no parameter metadata for function '{func}' in program '{prog}'")]
    MissingFuncInfo { func: String, prog: String },

    #[error("function '{func}' declares {count} parameters, at most 5 are supported")]
    TooManyParams { func: String, count: usize },
}

/// The three stack slots reserved above the deepest offset the verifier ever
/// reported for the program. Offsets are positive distances below `r10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Holds the looked-up coverage map value for the current frame.
    pub cover_map: i16,
    /// Scratch slot for the first spilled register.
    pub reg_save1: i16,
    /// Scratch slot for the second spilled register (also parks `r5` in
    /// five-argument prologues).
    pub reg_save2: i16,
}

impl StackLayout {
    /// Compute the layout from the merged verifier states: the reserved
    /// slots sit at +8/+16/+24 past the deepest slot the program touches.
    pub fn from_merged(merged: &[VerifierState]) -> StackLayout {
        let max_fp_off = merged
            .iter()
            .flat_map(|state| state.stack.iter())
            .map(|slot| slot.offset)
            .max()
            .unwrap_or(0) as i16;

        StackLayout {
            cover_map: max_fp_off + 8,
            reg_save1: max_fp_off + 16,
            reg_save2: max_fp_off + 24,
        }
    }
}

/// Registers the verifier mentioned at an instruction. Instructions the
/// exploration never reached report everything as used, so the trailer
/// falls back to spill/restore rather than clobbering a register the
/// verifier simply did not get to report on.
fn used_registers(state: Option<&VerifierState>) -> [bool; 11] {
    let Some(state) = state.filter(|s| !s.is_empty()) else {
        return [true; 11];
    };

    let mut used = [false; 11];
    for reg in &state.registers {
        if let Some(slot) = used.get_mut(reg.reg as usize) {
            *slot = true;
        }
    }
    used
}

fn reg(n: usize) -> Reg {
    Reg::from_u8(n as u8).expect("register index in range")
}

/// Counter increment for one block: load the hoisted map-value pointer,
/// bump the 16-bit counter at the block's offset, write it back.
fn block_trailer(out: &mut Vec<Insn>, used: [bool; 11], layout: StackLayout, counter_off: i16) {
    let mut free = (0u8..=9).filter(|r| !used[*r as usize]);
    let free1 = free.next();
    let free2 = free.next();

    let map_val = free1.map(|r| reg(r as usize)).unwrap_or(Reg::R8);
    if free1.is_none() {
        out.push(Insn::stxdw(Reg::R10, -layout.reg_save1, map_val));
    }

    let counter = match free2 {
        Some(r) => reg(r as usize),
        None if map_val == Reg::R9 => Reg::R8,
        None => Reg::R9,
    };
    if free2.is_none() {
        out.push(Insn::stxdw(Reg::R10, -layout.reg_save2, counter));
    }

    out.push(Insn::ldxdw(map_val, Reg::R10, -layout.cover_map));
    out.push(Insn::ldxh(counter, map_val, counter_off));
    out.push(Insn::add64_imm(counter, 1));
    out.push(Insn::stxh(map_val, counter_off, counter));

    if free1.is_none() {
        out.push(Insn::ldxdw(map_val, Reg::R10, -layout.reg_save1));
    }
    if free2.is_none() {
        out.push(Insn::ldxdw(counter, Reg::R10, -layout.reg_save2));
    }
}

/// Function-entry prologue: park the argument registers, look up the
/// coverage map value for key 0, store the pointer in its reserved slot and
/// restore the arguments. A null lookup result exits with -1; the map is an
/// array with one entry, so that never happens on a correctly loaded
/// program.
fn function_prologue(out: &mut Vec<Insn>, reg_cnt: usize, layout: StackLayout) {
    // Zero everything that may still be uninitialised so parking spills are
    // always well-defined.
    out.push(Insn::mov64_imm(Reg::R0, 0));
    for r in (1 + reg_cnt)..=9 {
        out.push(Insn::mov64_imm(reg(r), 0));
    }

    // Only r6-r9 are available for parking; a fifth argument goes to the
    // stack.
    let park = if reg_cnt == 5 {
        out.push(Insn::stxdw(Reg::R10, -layout.reg_save2, Reg::R5));
        4
    } else {
        reg_cnt
    };

    for r in 1..=park {
        out.push(Insn::mov64_reg(reg(r + 5), reg(r)));
    }

    out.push(Insn::ld_map_ptr(Reg::R1, COVER_MAP_NAME));
    out.push(Insn::mov64_reg(Reg::R2, Reg::R10));
    out.push(Insn::add64_imm(Reg::R2, -(layout.reg_save1 as i32)));
    out.push(Insn::st_imm_dw(Reg::R2, 0, 0));
    out.push(Insn::call_helper(BpfHelper::MapLookupElem));
    out.push(Insn::jne_imm(Reg::R0, 0, 2));
    out.push(Insn::mov64_imm(Reg::R0, -1));
    out.push(Insn::exit());
    out.push(Insn::stxdw(Reg::R10, -layout.cover_map, Reg::R0));

    for r in 1..=park {
        out.push(Insn::mov64_reg(reg(r), reg(r + 5)));
    }
    if reg_cnt == 5 {
        out.push(Insn::ldxdw(Reg::R5, Reg::R10, -layout.reg_save2));
    }
}

/// Rewrite one program so every basic block counts its executions.
///
/// `blocks` is the program's CFG, `merged` the per-raw-instruction liveness
/// union from the trial load, `func_params` the declared parameter count per
/// function symbol, and `block_id_base` the index of this program's first
/// block in the collection-wide block list.
///
/// The block symbol moves onto the first inserted instruction, so every jump
/// and call into a block passes through the counter update first.
pub fn instrument_program(
    prog_name: &str,
    blocks: &[ProgBlock],
    merged: &[VerifierState],
    func_params: &HashMap<String, usize>,
    block_id_base: usize,
) -> Result<Vec<Insn>, InstrumentError> {
    let layout = StackLayout::from_merged(merged);

    let mut entry_syms: HashSet<&str> = HashSet::new();
    entry_syms.insert(prog_name);
    for block in blocks {
        for insn in &block.insns {
            if insn.is_function_call() {
                if let Some(callee) = insn.reference() {
                    entry_syms.insert(callee);
                }
            }
        }
    }

    let mut out = Vec::new();
    let mut raw_idx = 0usize;

    for (i, block) in blocks.iter().enumerate() {
        let counter_off = ((block_id_base + i) * 2) as i16;
        let mut patch = Vec::new();

        let sym = block.symbol().unwrap_or("");
        if entry_syms.contains(sym) {
            let reg_cnt =
                *func_params
                    .get(sym)
                    .ok_or_else(|| InstrumentError::MissingFuncInfo {
                        func: sym.to_string(),
                        prog: prog_name.to_string(),
                    })?;
            if reg_cnt > 5 {
                return Err(InstrumentError::TooManyParams {
                    func: sym.to_string(),
                    count: reg_cnt,
                });
            }
            function_prologue(&mut patch, reg_cnt, layout);
        }

        block_trailer(
            &mut patch,
            used_registers(merged.get(raw_idx)),
            layout,
            counter_off,
        );

        // Move the symbol from the head of the original code onto the
        // instrumentation, so jumps and calls enter the counter update
        // first.
        patch[0].set_symbol(block.symbol().map(str::to_string));
        out.append(&mut patch);

        for (j, insn) in block.insns.iter().enumerate() {
            raw_idx += insn.raw_slots() as usize;
            let mut insn = insn.clone();
            if j == 0 {
                insn.set_symbol(None);
            }
            out.push(insn);
        }
    }

    Ok(out)
}

/// Instrument every program in a collection and register the coverage map.
///
/// Returns the collection-wide block list; its indices match the counter
/// layout inside the coverage map value. `verifier_logs` holds the trial
/// load's diagnostic per program.
pub fn instrument_collection(
    spec: &mut CollectionSpec,
    verifier_logs: &BTreeMap<String, String>,
    mut log: Option<&mut dyn io::Write>,
) -> Result<Vec<ProgBlock>, InstrumentError> {
    let mut block_list: Vec<ProgBlock> = Vec::new();

    for (name, prog) in spec.programs.iter_mut() {
        let log_text = verifier_logs
            .get(name)
            .map(String::as_str)
            .unwrap_or_default();
        let merged = merged_per_instruction(log_text);

        if let Some(w) = log.as_deref_mut() {
            let _ = writeln!(w, "--- {name} --- Merged states ---");
            for (i, state) in merged.iter().enumerate() {
                let _ = writeln!(w, "{i:5}: {state}");
            }
            let layout = StackLayout::from_merged(&merged);
            let _ = writeln!(w, "--- {name} --- Stack offsets ---");
            let _ = writeln!(w, "Cover map value: {}", layout.cover_map);
            let _ = writeln!(w, "Reg save 1: {}", layout.reg_save1);
            let _ = writeln!(w, "Reg save 2: {}", layout.reg_save2);
        }

        let blocks = program_blocks(prog.insns.clone());

        if let Some(w) = log.as_deref_mut() {
            let _ = writeln!(w, "--- {name} --- Blocks ---");
            for block in &blocks {
                let _ = writeln!(w, "Block {}:", block.index);
                for insn in &block.insns {
                    let _ = writeln!(w, "{insn}");
                }
            }
        }

        let rewritten = instrument_program(
            name,
            &blocks,
            &merged,
            &prog.func_params,
            block_list.len(),
        )?;

        if let Some(w) = log.as_deref_mut() {
            let _ = writeln!(w, "--- {name} --- Instrumented ---");
            for insn in &rewritten {
                let _ = writeln!(w, "{insn}");
            }
        }

        prog.insns = rewritten;
        block_list.extend(blocks);
    }

    spec.maps.insert(
        COVER_MAP_NAME.to_string(),
        MapSpec::cover_map(block_list.len()),
    );

    Ok(block_list)
}

#[cfg(test)]
mod tests;
