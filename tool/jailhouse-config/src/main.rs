//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use jailhouse_config::abi::{decode_descriptor, has_signature};
use jailhouse_config::report::{
    descriptor_json, violations_json, write_descriptor, write_report, write_violations,
};
use jailhouse_config::{
    check_with, sdf, validated_with, CellDescriptor, Descriptor, SharingTopology,
    SystemDescriptor, ValidationConfig, Violation,
};
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "jailhouse-config", version)]
/// Validate partition configurations and build loader blobs from them
struct CmdOptions {
    /// Print more output, repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a system with its guest cells and print every finding
    Check {
        /// System description (XML) or system blob
        system: PathBuf,

        /// Guest cell description or blob, validated jointly with the system
        #[arg(short, long = "cell")]
        cells: Vec<PathBuf>,

        /// Restrict memory sharing to the given pairs of cell names
        #[arg(long = "share", value_name = "CELL:CELL")]
        shares: Vec<String>,

        /// Write a layout report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Write the findings as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Validate jointly, then write one loader blob per input
    Build {
        system: PathBuf,

        #[arg(short, long = "cell")]
        cells: Vec<PathBuf>,

        #[arg(long = "share", value_name = "CELL:CELL")]
        shares: Vec<String>,

        /// Directory receiving `<name>.cell` files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Decode a loader blob and print its layout
    Dump {
        blob: PathBuf,

        /// Print the decoded descriptor as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load(path: &Path) -> anyhow::Result<Descriptor> {
    let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    if has_signature(&bytes) {
        debug!("decoding '{}' as a loader blob", path.display());
        return decode_descriptor(&bytes).with_context(|| format!("decoding '{}'", path.display()));
    }

    let xml = String::from_utf8(bytes)
        .with_context(|| format!("'{}' is neither a loader blob nor text", path.display()))?;
    let filename = path.display().to_string();
    sdf::parse(&filename, &xml).map_err(|err| anyhow!(err))
}

fn load_set(
    system: &Path,
    cells: &[PathBuf],
) -> anyhow::Result<(SystemDescriptor, Vec<CellDescriptor>)> {
    let Descriptor::System(system_descriptor) = load(system)? else {
        bail!("'{}' describes a cell, expected a system", system.display());
    };

    let mut cell_descriptors = Vec::with_capacity(cells.len());
    for path in cells {
        match load(path)? {
            Descriptor::Cell(cell) => cell_descriptors.push(cell),
            Descriptor::System(_) => {
                bail!("'{}' describes a system, expected a cell", path.display())
            }
        }
    }

    info!(
        "loaded system '{}' with {} guest cell(s)",
        system_descriptor.root.name,
        cell_descriptors.len()
    );
    Ok((system_descriptor, cell_descriptors))
}

fn validation_config(shares: &[String]) -> anyhow::Result<ValidationConfig> {
    let mut config = ValidationConfig::default();
    if shares.is_empty() {
        return Ok(config);
    }

    let mut pairs = Vec::with_capacity(shares.len());
    for share in shares {
        let Some((a, b)) = share.split_once(':') else {
            bail!("invalid sharing pair '{share}', expected 'CELL:CELL'");
        };
        pairs.push((a.to_string(), b.to_string()));
    }
    config.sharing = SharingTopology::Declared(pairs);
    Ok(config)
}

fn print_violations(violations: &[Violation]) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    write_violations(&mut out, violations)?;
    Ok(())
}

fn check(
    system: &Path,
    cells: &[PathBuf],
    shares: &[String],
    report: Option<&Path>,
    json: Option<&Path>,
) -> anyhow::Result<bool> {
    let (system, cells) = load_set(system, cells)?;
    let config = validation_config(shares)?;
    let violations = check_with(&system, &cells, &config);

    print_violations(&violations)?;

    if let Some(path) = report {
        let file =
            File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        let mut out = BufWriter::new(file);
        write_report(&mut out, &system, &cells, &violations)?;
        out.flush()?;
    }
    if let Some(path) = json {
        fs::write(path, violations_json(&violations)?)
            .with_context(|| format!("writing '{}'", path.display()))?;
    }

    Ok(!violations.iter().any(Violation::is_error))
}

fn blob_path(output_dir: &Path, input: &Path) -> anyhow::Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("'{}' has no file name", input.display()))?;
    Ok(output_dir.join(format!("{}.cell", stem.to_string_lossy())))
}

fn build(
    system_path: &Path,
    cell_paths: &[PathBuf],
    shares: &[String],
    output_dir: &Path,
) -> anyhow::Result<bool> {
    let (system, cells) = load_set(system_path, cell_paths)?;
    let config = validation_config(shares)?;

    let validated = match validated_with(&system, &cells, &config) {
        Ok(validated) => validated,
        Err(violations) => {
            print_violations(&violations)?;
            return Ok(false);
        }
    };
    if !validated.warnings().is_empty() {
        print_violations(validated.warnings())?;
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating '{}'", output_dir.display()))?;

    let mut outputs = vec![(blob_path(output_dir, system_path)?, validated.encode())];
    for (path, blob) in cell_paths.iter().zip(validated.encode_cells()) {
        outputs.push((blob_path(output_dir, path)?, blob));
    }
    for (path, blob) in outputs {
        fs::write(&path, &blob).with_context(|| format!("writing '{}'", path.display()))?;
        info!("wrote {} bytes to '{}'", blob.len(), path.display());
    }

    Ok(true)
}

fn dump(path: &Path, json: bool) -> anyhow::Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    if !has_signature(&bytes) {
        bail!("'{}' is not a loader blob", path.display());
    }
    let descriptor =
        decode_descriptor(&bytes).with_context(|| format!("decoding '{}'", path.display()))?;

    let mut out = io::stdout().lock();
    if json {
        writeln!(out, "{}", descriptor_json(&descriptor)?)?;
    } else {
        write_descriptor(&mut out, &descriptor)?;
    }
    Ok(true)
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn main() -> ExitCode {
    let options = CmdOptions::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(options.verbose))
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let result = match &options.command {
        Commands::Check {
            system,
            cells,
            shares,
            report,
            json,
        } => check(system, cells, shares, report.as_deref(), json.as_deref()),
        Commands::Build {
            system,
            cells,
            shares,
            output_dir,
        } => build(system, cells, shares, output_dir),
        Commands::Dump { blob, json } => dump(blob, *json),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("jailhouse-config: error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_log_level() {
        let options = CmdOptions::try_parse_from(["jailhouse-config", "dump", "a.cell"]).unwrap();
        assert_eq!(log_level(options.verbose), LevelFilter::WARN);

        let options =
            CmdOptions::try_parse_from(["jailhouse-config", "dump", "-vv", "a.cell"]).unwrap();
        assert_eq!(log_level(options.verbose), LevelFilter::DEBUG);
        assert_eq!(log_level(7), LevelFilter::TRACE);
    }
}
