//! `hfsconv archive <host-dir> <destination> [--name <volume-name>]` --
//! build a fresh HFS+ volume image from a host directory tree (spec.md
//! §1 "archiving").

use std::fs::File;
use std::path::Path;

use hfsconv::archive::{self, ArchiveOptions};

use crate::cli::{next_arg, take_flag};
use crate::error::Result;
use crate::style::{self, BOLD, GREEN, RESET};

pub(crate) fn run(args: &[&str]) -> Result<()> {
    let (name, args) = take_flag(args, "--name");

    let host_dir = next_arg(&args, 0, "host-dir")?;
    let destination = next_arg(&args, 1, "destination")?;

    let volume_name = name.map(str::to_string).unwrap_or_else(|| {
        Path::new(host_dir).file_name().map(|n| n.to_string_lossy().into_owned()).filter(|s| !s.is_empty()).unwrap_or_else(|| "Untitled".to_string())
    });

    let options = ArchiveOptions { volume_name };

    style::spinner_msg(&format!("archiving {host_dir} into {destination}"));
    let mut out = File::create(destination)?;
    let report = archive::build_volume_from_directory(Path::new(host_dir), &mut out, &options)?;
    style::spinner_done("");

    println!();
    println!("  {BOLD}{GREEN}archive complete{RESET}");
    style::kv("Files written", &report.files_written.to_string());
    style::kv("Folders created", &report.folders_created.to_string());
    if !report.warnings.is_empty() {
        style::section("Warnings");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}
