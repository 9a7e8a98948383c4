//! afptool: pack a directory into an RKAF update image, unpack one, or show its layout.
//!
//! Pack input: a directory with `parameter`, `package-file` and the files it lists.
//! Unpack output: every part written under the destination directory by its filename.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use rkaf::logger::StderrLogger;
use rkaf::{pack_dir, unpack_image, PackOptions, RkafError, RkafReader};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Show layout details (positions, sizes, flash addresses).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only report warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an image from a directory.
    Pack {
        src_dir: PathBuf,
        dest: PathBuf,
        /// TOML file overriding chunk_size, parameter_block_size, self_alignment.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Verify an image and extract its parts.
    Unpack { src: PathBuf, dest_dir: PathBuf },
    /// Print the header and part table.
    Info {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    StderrLogger::new(level).init()?;

    match cli.command {
        Command::Pack {
            src_dir,
            dest,
            config,
        } => {
            let options = match config {
                Some(path) => PackOptions::from_toml_file(path)?,
                None => PackOptions::default(),
            };
            let header = pack_dir(&src_dir, &dest, &options)?;
            eprintln!(
                "wrote {} ({} parts, {} bytes)",
                dest.display(),
                header.parts.len(),
                u64::from(header.length) + 4
            );
        }
        Command::Unpack { src, dest_dir } => {
            let report = unpack_image(&src, &dest_dir)?;
            for skipped in &report.skipped {
                eprintln!("skipped {}: {}", skipped.name, skipped.error);
            }
            eprintln!(
                "extracted {} parts to {} ({} skipped)",
                report.extracted.len(),
                dest_dir.display(),
                report.skipped.len()
            );
        }
        Command::Info { image, json } => {
            let mut reader = RkafReader::open(&image)?;
            let checksum = match reader.verify_checksum() {
                Ok(crc) => Ok(crc),
                Err(e @ (RkafError::ChecksumMismatch { .. } | RkafError::TruncatedChecksum(_))) => {
                    Err(e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            let header = &reader.header;
            if json {
                let value = serde_json::json!({
                    "firmware_version": header.firmware_version().to_string(),
                    "checksum": checksum.as_ref().map(|crc| format!("{crc:#010x}")).ok(),
                    "checksum_error": checksum.as_ref().err(),
                    "header": header,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            println!("model:        {}", header.model);
            println!("id:           {}", header.id);
            println!("manufacturer: {}", header.manufacturer);
            println!("version:      {}", header.firmware_version());
            println!("length:       {:#x}", header.length);
            match &checksum {
                Ok(crc) => println!("checksum:     {crc:#010x} OK"),
                Err(e) => println!("checksum:     FAILED ({e})"),
            }
            println!();
            println!(
                "{:<16} {:<32} {:>10} {:>10} {:>10} {:>10}",
                "name", "filename", "pos", "size", "nand_addr", "nand_size"
            );
            for part in reader.parts() {
                let nand_addr = if part.is_nand_resolved() {
                    format!("{:#x}", part.nand_addr)
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<16} {:<32} {:>10} {:>10} {:>10} {:>10}",
                    part.name,
                    part.filename,
                    format!("{:#x}", part.pos),
                    format!("{:#x}", part.size),
                    nand_addr,
                    format!("{:#x}", part.nand_size)
                );
            }
        }
    }
    Ok(())
}
