use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

use coverbee::cover;
use coverbee::elf::{self, ProgType};
use coverbee::instrument::COVER_MAP_NAME;
use coverbee::loader::{self, sys, LoadOptions};

#[derive(Parser)]
#[command(name = "coverbee")]
#[command(about = "Source-level code coverage for eBPF programs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument all programs in the given ELF file and load them into the kernel
    Load {
        /// Path to the ELF file containing the programs
        #[arg(long)]
        elf: PathBuf,

        /// Directory where the loaded programs will be pinned
        #[arg(long)]
        prog_pin_dir: PathBuf,

        /// Explicitly set the program type for programs of unknown type
        #[arg(long)]
        prog_type: Option<String>,

        /// Directory containing map pins
        #[arg(long)]
        map_pin_dir: Option<PathBuf>,

        /// Pin path for the covermap (created by coverbee, holds the
        /// coverage counters)
        #[arg(long)]
        covermap_pin: Option<PathBuf>,

        /// Path where the block list is stored (maps coverage data to
        /// source code, needed when reading from the covermap)
        #[arg(long)]
        block_list: PathBuf,

        /// Path for ultra-verbose log output
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Collect coverage data and output to file
    Cover {
        /// Directory containing map pins
        #[arg(long)]
        map_pin_dir: Option<PathBuf>,

        /// Pin path for the covermap
        #[arg(long)]
        covermap_pin: Option<PathBuf>,

        /// Path where the block list is stored
        #[arg(long)]
        block_list: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "html")]
        format: OutputFormat,

        /// Path to the coverage output, `-` for stdout
        #[arg(long)]
        output: String,

        /// Disable source based interpolation
        #[arg(long)]
        disable_interpolation: bool,

        /// Force source based interpolation, or error
        #[arg(long)]
        force_interpolation: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Html,
    GoCover,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Load {
            elf,
            prog_pin_dir,
            prog_type,
            map_pin_dir,
            covermap_pin,
            block_list,
            log,
        } => load(
            &elf,
            &prog_pin_dir,
            prog_type.as_deref(),
            map_pin_dir,
            covermap_pin,
            &block_list,
            log,
        ),
        Commands::Cover {
            map_pin_dir,
            covermap_pin,
            block_list,
            format,
            output,
            disable_interpolation,
            force_interpolation,
        } => cover_cmd(
            map_pin_dir,
            covermap_pin,
            &block_list,
            format,
            &output,
            disable_interpolation,
            force_interpolation,
        ),
    };

    if let Err(err) = result {
        eprintln!("{err}");
        process::exit(1);
    }
}

/// Exactly one of `--map-pin-dir` and `--covermap-pin` names the covermap.
fn covermap_pin_path(
    map_pin_dir: &Option<PathBuf>,
    covermap_pin: &Option<PathBuf>,
) -> Result<PathBuf, Box<dyn Error>> {
    match (map_pin_dir, covermap_pin) {
        (Some(_), Some(_)) => {
            Err("either --map-pin-dir or --covermap-pin must be set, not both".into())
        }
        (Some(dir), None) => Ok(dir.join(COVER_MAP_NAME)),
        (None, Some(path)) => Ok(path.clone()),
        (None, None) => Err("either --map-pin-dir or --covermap-pin must be set".into()),
    }
}

#[allow(clippy::too_many_arguments)]
fn load(
    elf_path: &Path,
    prog_pin_dir: &Path,
    prog_type: Option<&str>,
    map_pin_dir: Option<PathBuf>,
    covermap_pin: Option<PathBuf>,
    block_list_path: &Path,
    log_path: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    // validate the flag pairing up front, before touching the kernel
    covermap_pin_path(&map_pin_dir, &covermap_pin)?;

    let data = fs::read(elf_path)
        .map_err(|e| format!("read ELF '{}': {e}", elf_path.display()))?;
    let mut spec = elf::parse_elf(&data)?;

    if let Some(flag) = prog_type {
        let Some(override_type) = ProgType::from_flag(flag) else {
            let mut msg = format!("Invalid --prog-type value '{flag}', pick from:\n");
            for option in ProgType::flag_names() {
                msg.push_str(&format!(" - {option}\n"));
            }
            return Err(msg.into());
        };

        // only programs of unknown type are overridden
        for prog in spec.programs.values_mut() {
            if prog.prog_type == ProgType::Unspecified {
                prog.prog_type = override_type;
            }
        }
    }

    let opts = LoadOptions {
        log_level: 0,
        log_size: 32 << 20,
        map_pin_dir: map_pin_dir.clone(),
    };

    let mut log_file = match log_path {
        Some(path) => Some(io::BufWriter::new(
            fs::File::create(&path).map_err(|e| format!("open log file: {e}"))?,
        )),
        None => None,
    };
    let log_writer = log_file.as_mut().map(|w| w as &mut dyn Write);

    let (coll, blocks) = loader::instrument_and_load(&spec, &opts, log_writer)
        .map_err(|e| format!("error while instrumenting and loading program: {e}"))?;

    if let Some(w) = log_file.as_mut() {
        w.flush()?;
    }

    for (name, prog) in &coll.programs {
        sys::pin(&prog.fd, &prog_pin_dir.join(name))
            .map_err(|e| format!("error pinning program '{name}': {e}"))?;
    }

    // with --map-pin-dir the covermap was pinned with the other maps during
    // the load; an explicit --covermap-pin is done here
    if let Some(path) = &covermap_pin {
        let covermap = coll
            .maps
            .get(COVER_MAP_NAME)
            .ok_or("instrumented collection has no covermap")?;
        sys::pin(covermap, path).map_err(|e| format!("error pinning covermap: {e}"))?;
    }

    let block_list = cover::cfg_to_block_list(&blocks);
    cover::write_block_list(&block_list, block_list_path)
        .map_err(|e| format!("error encoding block-list: {e}"))?;

    println!("Programs instrumented and loaded");
    Ok(())
}

fn cover_cmd(
    map_pin_dir: Option<PathBuf>,
    covermap_pin: Option<PathBuf>,
    block_list_path: &Path,
    format: OutputFormat,
    output: &str,
    disable_interpolation: bool,
    force_interpolation: bool,
) -> Result<(), Box<dyn Error>> {
    let pin_path = covermap_pin_path(&map_pin_dir, &covermap_pin)?;
    let covermap =
        sys::obj_get(&pin_path).map_err(|e| format!("load covermap pin: {e}"))?;

    let mut block_list = cover::read_block_list(block_list_path)
        .map_err(|e| format!("decode block-list: {e}"))?;

    cover::collect(&covermap, &mut block_list)
        .map_err(|e| format!("apply covermap: {e}"))?;

    let out_blocks = if disable_interpolation {
        block_list
    } else {
        match cover::interpolate(&block_list) {
            Ok(blocks) => blocks,
            Err(err) if force_interpolation => {
                return Err(format!("error while interpolating using source files: {err}").into())
            }
            Err(err) => {
                log::warn!("interpolation using source files failed, falling back: {err}");
                block_list
            }
        }
    };

    let mut out: Box<dyn Write> = if output == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            fs::File::create(output).map_err(|e| format!("error creating output file: {e}"))?,
        )
    };

    match format {
        OutputFormat::Html => cover::write_html(&out_blocks, &mut out)?,
        OutputFormat::GoCover => cover::write_go_cover(&out_blocks, &mut out, "count")?,
    }

    Ok(())
}
