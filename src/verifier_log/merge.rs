//! Per-instruction merge of every verifier state the log mentions.
//!
//! The result is not useful for its values, only for which registers and
//! stack slots appear at all: a key absent from the merged state at an
//! instruction was never touched on any explored path there.

use super::state::VerifierState;
use super::{parse_verifier_log, VerifierStatement};

/// Fold the statement stream into a per-raw-instruction union of observed
/// register and stack-slot states, across every permutation the verifier
/// explored. The array grows to cover the highest instruction index seen;
/// entries the exploration never reached stay empty.
pub fn merged_per_instruction(log: &str) -> Vec<VerifierState> {
    let mut states: Vec<VerifierState> = Vec::new();
    let mut current = VerifierState::default();

    for statement in parse_verifier_log(log) {
        match statement {
            // Recaps carry only the entries that changed: merge the diff.
            VerifierStatement::RecapState { state, .. } => current.merge_from(&state),

            // The verifier moved back into the caller's frame.
            VerifierStatement::ReturnFunctionCall { caller, .. } => current = caller,

            // The verifier switched to another branch permutation.
            VerifierStatement::BranchEvaluation { state, .. } => current = state,

            VerifierStatement::Instruction { insn } => {
                publish(&mut states, insn.idx, &current);
            }

            VerifierStatement::InstructionState { insn, state } => {
                publish(&mut states, insn.idx, &current);
                current.merge_from(&state);
            }

            _ => {}
        }
    }

    states
}

/// Union the current state into the accumulator at `idx`. Later snapshots
/// overwrite earlier ones for the same key; keys are never removed.
fn publish(states: &mut Vec<VerifierState>, idx: usize, current: &VerifierState) {
    if idx >= states.len() {
        states.resize_with(idx + 1, VerifierState::default);
    }
    states[idx].merge_from(current);
}
