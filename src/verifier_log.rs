//! Kernel verifier log parser
//!
//! The verbose verifier diagnostic is a line-oriented text format. This
//! module turns it into a stream of [`VerifierStatement`] values, one per
//! logical statement (a few statements span multiple lines). Lines the
//! parser does not recognize become [`VerifierStatement::Unknown`]; lines
//! that match a known shape but fail mid-parse become
//! [`VerifierStatement::Error`]. Parsing never aborts.
//!
//! Every statement renders back to its source text via `Display`, modulo
//! whitespace normalization, so a parsed log can be dumped for inspection.

use std::fmt;

mod merge;
mod state;

pub use merge::merged_per_instruction;
pub use state::{
    BaseType, Liveness, RegType, RegValue, RegisterState, SlotKind, StackState, TNum,
    VerifierState,
};

/// An instruction as it appears in the log: raw index, opcode byte and the
/// disassembly text.
///
/// Example: `22: (85) call pc+4`
#[derive(Debug, Clone, PartialEq)]
pub struct LogInsn {
    pub idx: usize,
    pub opcode: u8,
    pub assembly: String,
}

impl fmt::Display for LogInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ({:02x}) {}", self.idx, self.opcode, self.assembly)
    }
}

/// One statement of the verifier log.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifierStatement {
    /// Source-line echo, e.g. `; if (data + nh_off > data_end)`
    Comment { text: String },
    /// Sub-program location, e.g. `func#3 @85`
    SubProgLocation { prog_id: usize, start_insn: usize },
    /// Precision propagation, e.g. `propagating r6` / `propagating fp-8`
    PropagatePrecision {
        register: Option<u8>,
        stack_off: Option<i32>,
    },
    /// Start of a back-tracking walk, e.g. `last_idx 26 first_idx 20`
    BackTrackingHeader { last: usize, first: usize },
    /// One back-tracked instruction, e.g. `regs=4 stack=0 before 25: (bf) r1 = r0`
    BackTrackInstruction { regs: u64, stack: u64, insn: LogInsn },
    /// End of a back-tracking walk, e.g. `parent didn't have regs=4 stack=0 marks`
    BackTrackingTrailer {
        parent_match: bool,
        regs: u64,
        stack: u64,
        state: VerifierState,
    },
    /// The verifier follows a bpf-to-bpf call (two-line `caller:`/`callee:` block).
    FunctionCall {
        caller: VerifierState,
        callee: VerifierState,
    },
    /// The verifier returns from a bpf-to-bpf call (three-line block).
    ReturnFunctionCall {
        callee: VerifierState,
        call_site: usize,
        caller: VerifierState,
    },
    /// A state was found safe and pruned, e.g. `25: safe` or `from 42 to 57: safe`
    StatePruned { from: usize, to: usize },
    /// The verifier switched to another branch permutation,
    /// e.g. `from 84 to 40: R0=invP(id=0) R10=fp0`
    BranchEvaluation {
        from: usize,
        to: usize,
        state: VerifierState,
    },
    /// Evaluated instruction with the state after it,
    /// e.g. `0: (b7) r6 = 1; R6_w=invP1`
    InstructionState { insn: LogInsn, state: VerifierState },
    /// Evaluated instruction without state, e.g. `23: (05) goto pc+1`
    Instruction { insn: LogInsn },
    /// State recap without an evaluated instruction,
    /// e.g. `0: R1=ctx(id=0,off=0,imm=0) R10=fp0`
    RecapState { insn_idx: usize, state: VerifierState },
    /// Final statistics, e.g. `processed 520 insns (limit 1000000) ...`
    VerifierDone {
        insns_processed: usize,
        insn_limit: usize,
        max_states_per_insn: usize,
        total_states: usize,
        peak_states: usize,
        mark_read: usize,
    },
    /// A recognized shape that failed to parse fully.
    Error { message: String },
    /// Anything else.
    Unknown { line: String },
}

/// Parse the whole verbose verifier log, in order.
pub fn parse_verifier_log(log: &str) -> Vec<VerifierStatement> {
    let mut lines = log.lines();
    let mut statements = Vec::new();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        statements.push(parse_statement(line, &mut lines));
    }

    statements
}

fn parse_statement<'a, I>(line: &str, lines: &mut I) -> VerifierStatement
where
    I: Iterator<Item = &'a str>,
{
    if let Some(text) = line.strip_prefix(';') {
        return VerifierStatement::Comment {
            text: text.trim_start().to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix("func#") {
        return parse_sub_prog_location(rest, line);
    }

    if let Some(rest) = line.strip_prefix("propagating ") {
        return parse_propagate_precision(rest);
    }

    if let Some(rest) = line.strip_prefix("last_idx ") {
        return match split_number(rest).and_then(|(last, rest)| {
            let rest = rest.trim_start().strip_prefix("first_idx ")?;
            let (first, _) = split_number(rest)?;
            Some((last, first))
        }) {
            Some((last, first)) => VerifierStatement::BackTrackingHeader { last, first },
            None => error("back-tracking header", line),
        };
    }

    if line.trim() == "caller:" {
        return parse_function_call(lines);
    }

    if line.starts_with("returning from callee") {
        return parse_return_function_call(lines);
    }

    if let Some(rest) = line.strip_prefix("regs=") {
        return parse_back_track_instruction(rest, line);
    }

    if line.starts_with("parent ") {
        return parse_back_tracking_trailer(line);
    }

    if let Some(rest) = line.strip_prefix("processed ") {
        return parse_verifier_done(rest, line);
    }

    if let Some(rest) = line.strip_prefix("from ") {
        if let Some(stmt) = parse_from_range(rest) {
            return stmt;
        }
        return VerifierStatement::Unknown {
            line: line.to_string(),
        };
    }

    if line.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some(stmt) = parse_numbered_line(line) {
            return stmt;
        }
    }

    VerifierStatement::Unknown {
        line: line.to_string(),
    }
}

fn error(what: &str, line: &str) -> VerifierStatement {
    VerifierStatement::Error {
        message: format!("{what}: {line}"),
    }
}

/// Leading decimal number plus the remainder.
fn split_number(s: &str) -> Option<(usize, &str)> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].parse().ok()?, &s[end..]))
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s, 16).ok()
}

fn parse_sub_prog_location(rest: &str, line: &str) -> VerifierStatement {
    let parsed = split_number(rest).and_then(|(prog_id, rest)| {
        let rest = rest.trim_start().strip_prefix('@')?;
        let (start_insn, _) = split_number(rest)?;
        Some((prog_id, start_insn))
    });
    match parsed {
        Some((prog_id, start_insn)) => VerifierStatement::SubProgLocation {
            prog_id,
            start_insn,
        },
        None => error("sub-program location", line),
    }
}

fn parse_propagate_precision(rest: &str) -> VerifierStatement {
    if let Some(reg) = rest.strip_prefix('r').and_then(|r| r.parse::<u8>().ok()) {
        return VerifierStatement::PropagatePrecision {
            register: Some(reg),
            stack_off: None,
        };
    }

    let off = rest
        .strip_prefix("fp-")
        .and_then(|o| o.parse::<i32>().ok())
        .unwrap_or(0);
    VerifierStatement::PropagatePrecision {
        register: None,
        stack_off: Some(off),
    }
}

fn parse_function_call<'a, I>(lines: &mut I) -> VerifierStatement
where
    I: Iterator<Item = &'a str>,
{
    let Some(caller_line) = lines.next() else {
        return error("function call", "missing caller state");
    };
    let caller = VerifierState::parse(caller_line);

    if lines.next().map(str::trim) != Some("callee:") {
        return error("function call", "missing callee marker");
    }

    let Some(callee_line) = lines.next() else {
        return error("function call", "missing callee state");
    };

    VerifierStatement::FunctionCall {
        caller,
        callee: VerifierState::parse(callee_line),
    }
}

fn parse_return_function_call<'a, I>(lines: &mut I) -> VerifierStatement
where
    I: Iterator<Item = &'a str>,
{
    let Some(callee_line) = lines.next() else {
        return error("return from call", "missing callee state");
    };
    let callee = VerifierState::parse(callee_line);

    let call_site = lines
        .next()
        .and_then(|l| l.trim().strip_prefix("to caller at "))
        .and_then(|l| split_number(l).map(|(n, _)| n));
    let Some(call_site) = call_site else {
        return error("return from call", "missing call site");
    };

    let Some(caller_line) = lines.next() else {
        return error("return from call", "missing caller state");
    };

    VerifierStatement::ReturnFunctionCall {
        callee,
        call_site,
        caller: VerifierState::parse(caller_line),
    }
}

fn parse_back_track_instruction(rest: &str, line: &str) -> VerifierStatement {
    let parsed = (|| {
        let (regs, rest) = rest.split_once(' ')?;
        let regs = parse_hex(regs)?;
        let rest = rest.trim_start().strip_prefix("stack=")?;
        let (stack, rest) = rest.split_once(' ')?;
        let stack = parse_hex(stack)?;
        let rest = rest.trim_start().strip_prefix("before ")?;
        let insn = parse_insn_line(rest)?;
        Some((regs, stack, insn))
    })();

    match parsed {
        Some((regs, stack, insn)) => VerifierStatement::BackTrackInstruction { regs, stack, insn },
        None => error("back-track instruction", line),
    }
}

fn parse_back_tracking_trailer(line: &str) -> VerifierStatement {
    let (parent_match, rest) = if let Some(rest) = line.strip_prefix("parent didn't have ") {
        (false, rest)
    } else if let Some(rest) = line.strip_prefix("parent already had ") {
        (true, rest)
    } else {
        return VerifierStatement::Unknown {
            line: line.to_string(),
        };
    };

    let parsed = (|| {
        let rest = rest.strip_prefix("regs=")?;
        let (regs, rest) = rest.split_once(' ')?;
        let regs = parse_hex(regs)?;
        let rest = rest.trim_start().strip_prefix("stack=")?;
        let (stack, rest) = match rest.split_once(' ') {
            Some((stack, rest)) => (stack, rest),
            None => (rest, ""),
        };
        let stack = parse_hex(stack)?;
        let rest = rest
            .trim_start()
            .strip_prefix("marks")
            .unwrap_or(rest)
            .trim_start_matches(':')
            .trim_start();
        Some((regs, stack, VerifierState::parse(rest)))
    })();

    match parsed {
        Some((regs, stack, state)) => VerifierStatement::BackTrackingTrailer {
            parent_match,
            regs,
            stack,
            state,
        },
        None => error("back-tracking trailer", line),
    }
}

fn parse_verifier_done(rest: &str, line: &str) -> VerifierStatement {
    let parsed = (|| {
        let (insns_processed, rest) = split_number(rest)?;
        let rest = rest.strip_prefix(" insns (limit ")?;
        let (insn_limit, rest) = split_number(rest)?;
        let rest = rest.strip_prefix(") max_states_per_insn ")?;
        let (max_states_per_insn, rest) = split_number(rest)?;
        let rest = rest.strip_prefix(" total_states ")?;
        let (total_states, rest) = split_number(rest)?;
        let rest = rest.strip_prefix(" peak_states ")?;
        let (peak_states, rest) = split_number(rest)?;
        let rest = rest.strip_prefix(" mark_read ")?;
        let (mark_read, _) = split_number(rest)?;
        Some(VerifierStatement::VerifierDone {
            insns_processed,
            insn_limit,
            max_states_per_insn,
            total_states,
            peak_states,
            mark_read,
        })
    })();

    parsed.unwrap_or_else(|| VerifierStatement::Unknown {
        line: line.to_string(),
    })
}

/// `from N to M: safe` or `from N to M: <state>`
fn parse_from_range(rest: &str) -> Option<VerifierStatement> {
    let (from, rest) = split_number(rest)?;
    let rest = rest.strip_prefix(" to ")?;
    let (to, rest) = split_number(rest)?;
    let rest = rest.strip_prefix(':')?.trim_start();

    if rest == "safe" {
        return Some(VerifierStatement::StatePruned { from, to });
    }

    Some(VerifierStatement::BranchEvaluation {
        from,
        to,
        state: VerifierState::parse(rest),
    })
}

/// `N: safe`, `N: (xx) <asm>[; <state>]` or `N: <state>`
fn parse_numbered_line(line: &str) -> Option<VerifierStatement> {
    let (idx, rest) = split_number(line)?;
    let rest = rest.strip_prefix(':')?.trim_start();

    if rest == "safe" {
        return Some(VerifierStatement::StatePruned { from: idx, to: idx });
    }

    if rest.starts_with('(') {
        // The disassembly itself never contains a semicolon; everything
        // after one is the state snapshot.
        return Some(match line.split_once(';') {
            Some((insn_part, state_part)) => VerifierStatement::InstructionState {
                insn: parse_insn_line(insn_part)?,
                state: VerifierState::parse(state_part),
            },
            None => VerifierStatement::Instruction {
                insn: parse_insn_line(line)?,
            },
        });
    }

    Some(VerifierStatement::RecapState {
        insn_idx: idx,
        state: VerifierState::parse(rest),
    })
}

/// `N: (xx) <asm>` with an optional `; <state>` tail.
fn parse_insn_line(line: &str) -> Option<LogInsn> {
    let (idx, rest) = split_number(line)?;
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('(')?;
    let opcode = u8::from_str_radix(rest.get(..2)?, 16).ok()?;
    let rest = rest.get(2..)?.strip_prefix(')')?;

    Some(LogInsn {
        idx,
        opcode,
        assembly: rest.trim().to_string(),
    })
}

impl fmt::Display for VerifierStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use VerifierStatement::*;
        match self {
            Comment { text } => write!(f, "; {text}"),
            SubProgLocation { prog_id, start_insn } => write!(f, "func#{prog_id} @{start_insn}"),
            PropagatePrecision { register, stack_off } => match register {
                Some(reg) => write!(f, "propagating r{reg}"),
                None => write!(f, "propagating fp-{}", stack_off.unwrap_or(0)),
            },
            BackTrackingHeader { last, first } => write!(f, "last_idx {last} first_idx {first}"),
            BackTrackInstruction { regs, stack, insn } => {
                write!(f, "regs={regs:x} stack={stack:x} before {insn}")
            }
            BackTrackingTrailer {
                parent_match,
                regs,
                stack,
                state,
            } => {
                let verb = if *parent_match {
                    "already had"
                } else {
                    "didn't have"
                };
                write!(f, "parent {verb} regs={regs:x} stack={stack:x} marks: {state}")
            }
            FunctionCall { caller, callee } => {
                write!(f, "caller:\n{caller}\ncallee:\n{callee}")
            }
            ReturnFunctionCall {
                callee,
                call_site,
                caller,
            } => write!(
                f,
                "returning from callee:\n{callee}\nto caller at {call_site}:\n{caller}"
            ),
            StatePruned { from, to } => {
                if from == to {
                    write!(f, "{from}: safe")
                } else {
                    write!(f, "from {from} to {to}: safe")
                }
            }
            BranchEvaluation { from, to, state } => write!(f, "from {from} to {to}: {state}"),
            InstructionState { insn, state } => write!(f, "{insn}; {state}"),
            Instruction { insn } => write!(f, "{insn}"),
            RecapState { insn_idx, state } => write!(f, "{insn_idx}: {state}"),
            VerifierDone {
                insns_processed,
                insn_limit,
                max_states_per_insn,
                total_states,
                peak_states,
                mark_read,
            } => write!(
                f,
                "processed {insns_processed} insns (limit {insn_limit}) \
                 max_states_per_insn {max_states_per_insn} total_states {total_states} \
                 peak_states {peak_states} mark_read {mark_read}"
            ),
            Error { message } => write!(f, "{message}"),
            Unknown { line } => write!(f, "{line}"),
        }
    }
}
