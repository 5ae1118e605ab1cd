//! Source-level code coverage for kernel eBPF programs.
//!
//! The pipeline: parse a compiled BPF ELF, trial-load it to capture the
//! verbose verifier diagnostic, fold that diagnostic into a per-instruction
//! register/stack liveness summary, split each program into basic blocks,
//! splice a counter increment into every block (using only registers the
//! summary proves dead), and load the rewritten programs. A later pass
//! reads the counters back out of the pinned coverage map and renders them
//! as line coverage.
//!
//! The library is used by the `coverbee` binary and by tests; the pure
//! stages (parsing, merging, CFG, instrumentation) have no kernel
//! dependencies.

pub mod cfg;
pub mod cover;
pub mod elf;
pub mod insn;
pub mod instrument;
pub mod loader;
pub mod verifier_log;
