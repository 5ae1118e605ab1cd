//! Kernel loading for instrumented collections.
//!
//! The flow mirrors what the instrumentation needs: a trial load of the
//! unmodified programs at the highest verifier log level to capture the
//! liveness diagnostic, then the real load of the rewritten programs with
//! the coverage map attached. The trial collection is closed before the
//! real one is created.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use crate::cfg::ProgBlock;
use crate::elf::{CollectionSpec, ProgType};
use crate::insn::{encode_program, resolve_references, InsnError};
use crate::instrument::{instrument_collection, InstrumentError};
use crate::verifier_log::parse_verifier_log;

pub mod sys;

/// Attempts for the trial load; the log buffer quadruples after each
/// `ENOSPC` failure.
const TRIAL_MAX_ATTEMPTS: usize = 5;
/// Initial trial-load log buffer size.
const TRIAL_LOG_SIZE: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("program '{name}' has an unspecified type, use --prog-type to explicitly set one")]
    UnspecifiedType { name: String },

    #[error("create map '{name}': {source}")]
    MapCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("program '{name}' references unknown map '{map}'")]
    UnknownMap { name: String, map: String },

    #[error("load program '{name}': {source}\n{verifier_log}")]
    ProgramLoad {
        name: String,
        #[source]
        source: io::Error,
        verifier_log: String,
    },

    #[error("verifier log does not fit after {attempts} buffer size increases")]
    LogBufferExhausted { attempts: usize },

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Insn(#[from] InsnError),
}

/// Options for one load of a collection.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Verifier log level (0 = off, 1 = normal, 2 = verbose).
    pub log_level: u32,
    /// Size of the verifier log buffer, only used when `log_level > 0`.
    pub log_size: usize,
    /// Reuse and create map pins in this directory.
    pub map_pin_dir: Option<PathBuf>,
}

/// A program loaded into the kernel.
#[derive(Debug)]
pub struct LoadedProgram {
    pub fd: OwnedFd,
    pub verifier_log: String,
}

/// A loaded collection. Dropping it releases every kernel resource that is
/// not pinned elsewhere.
#[derive(Debug, Default)]
pub struct Collection {
    pub programs: BTreeMap<String, LoadedProgram>,
    pub maps: BTreeMap<String, OwnedFd>,
}

/// Load every map and program of a spec into the kernel.
pub fn load_collection(spec: &CollectionSpec, opts: &LoadOptions) -> Result<Collection, LoadError> {
    for (name, prog) in &spec.programs {
        if prog.prog_type == ProgType::Unspecified {
            return Err(LoadError::UnspecifiedType { name: name.clone() });
        }
    }

    let mut coll = Collection::default();

    for (name, map_spec) in &spec.maps {
        let map_create = |source| LoadError::MapCreate {
            name: name.clone(),
            source,
        };

        let fd = match &opts.map_pin_dir {
            Some(dir) => {
                // An existing pin is reused; a fresh map is pinned for the
                // coverage collector to find later.
                let pin_path = dir.join(name);
                match sys::obj_get(&pin_path) {
                    Ok(fd) => fd,
                    Err(_) => {
                        let fd = sys::create_map(map_spec).map_err(map_create)?;
                        sys::pin(&fd, &pin_path).map_err(map_create)?;
                        fd
                    }
                }
            }
            None => sys::create_map(map_spec).map_err(map_create)?,
        };
        coll.maps.insert(name.clone(), fd);
    }

    for (name, prog) in &spec.programs {
        let mut insns = prog.insns.clone();

        for insn in &mut insns {
            if !insn.is_map_load() {
                continue;
            }
            let Some(map_name) = insn.reference() else { continue };
            let fd = coll
                .maps
                .get(map_name)
                .ok_or_else(|| LoadError::UnknownMap {
                    name: name.clone(),
                    map: map_name.to_string(),
                })?;
            insn.imm = fd.as_raw_fd() as i64;
        }

        resolve_references(&mut insns)?;
        let bytes = encode_program(&insns);

        let mut log_buf = vec![0u8; if opts.log_level > 0 { opts.log_size } else { 0 }];
        let result = sys::load_program(
            prog.prog_type.as_u32(),
            name,
            &bytes,
            &spec.license,
            opts.log_level,
            &mut log_buf,
        );
        let verifier_log = sys::log_text(&log_buf);

        match result {
            Ok(fd) => {
                coll.programs
                    .insert(name.clone(), LoadedProgram { fd, verifier_log });
            }
            Err(source) => {
                return Err(LoadError::ProgramLoad {
                    name: name.clone(),
                    source,
                    verifier_log,
                })
            }
        }
    }

    Ok(coll)
}

/// Trial-load the original collection at full verifier verbosity and return
/// each program's diagnostic. Retries with a quadrupled log buffer while
/// the kernel reports `ENOSPC`; any other error is surfaced as-is. The
/// trial collection is dropped before this returns.
fn trial_verifier_logs(spec: &CollectionSpec) -> Result<BTreeMap<String, String>, LoadError> {
    let mut opts = LoadOptions {
        log_level: 2,
        log_size: TRIAL_LOG_SIZE,
        map_pin_dir: None,
    };

    for _ in 0..TRIAL_MAX_ATTEMPTS {
        match load_collection(spec, &opts) {
            Ok(coll) => {
                return Ok(coll
                    .programs
                    .into_iter()
                    .map(|(name, prog)| (name, prog.verifier_log))
                    .collect());
            }
            Err(LoadError::ProgramLoad { source, .. })
                if source.raw_os_error() == Some(libc::ENOSPC) =>
            {
                opts.log_size <<= 2;
            }
            Err(err) => return Err(err),
        }
    }

    Err(LoadError::LogBufferExhausted {
        attempts: TRIAL_MAX_ATTEMPTS,
    })
}

/// Instrument every program of a collection and load the result.
///
/// Returns the loaded collection and the collection-wide block list whose
/// indices match the counters in the coverage map. `log` receives the full
/// instrumentation transcript when given.
pub fn instrument_and_load(
    spec: &CollectionSpec,
    opts: &LoadOptions,
    mut log: Option<&mut dyn Write>,
) -> Result<(Collection, Vec<ProgBlock>), LoadError> {
    if let Some(w) = log.as_deref_mut() {
        let _ = writeln!(w, "=== Original program ===");
        for (name, prog) in &spec.programs {
            let _ = writeln!(w, "--- {name} ---");
            for insn in &prog.insns {
                let _ = writeln!(w, "{insn}");
            }
        }
    }

    let verifier_logs = trial_verifier_logs(spec)?;

    if let Some(w) = log.as_deref_mut() {
        let _ = writeln!(w, "=== Original verifier logs ===");
        for (name, text) in &verifier_logs {
            let _ = writeln!(w, "--- {name} ---");
            let _ = writeln!(w, "{text}");
        }

        let _ = writeln!(w, "=== Parsed verifier logs ===");
        for (name, text) in &verifier_logs {
            let _ = writeln!(w, "--- {name} ---");
            for statement in parse_verifier_log(text) {
                let _ = writeln!(w, "{statement:?}");
            }
        }
    }

    let mut spec = spec.clone();
    let blocks = instrument_collection(
        &mut spec,
        &verifier_logs,
        log.as_deref_mut().map(|w| w as &mut dyn Write),
    )?;

    // Verbose final load when a transcript is wanted, so the instrumented
    // programs' verifier logs land in it too.
    let mut opts = opts.clone();
    if log.is_some() && opts.log_level < 2 {
        opts.log_level = 2;
        opts.log_size = opts.log_size.max(TRIAL_LOG_SIZE);
    }

    let coll = load_collection(&spec, &opts)?;

    if let Some(w) = log.as_deref_mut() {
        let _ = writeln!(w, "=== Instrumented verifier logs ===");
        for (name, prog) in &coll.programs {
            let _ = writeln!(w, "--- {name} ---");
            let _ = writeln!(w, "{}", prog.verifier_log);
        }
    }

    Ok((coll, blocks))
}
