//! `hfsconv convert <source> <destination> [--encoding name-or-number]
//! [--strict] [-v]` -- the headline command: HFS -> HFS+ conversion
//! (spec.md §4.9).

use std::fs::File;

use hfsconv::pipeline::{self, Cancellation, ConvertOptions, ProgressEvent, ProgressSink};

use crate::cli::{next_arg, open_source, parse_encoding, take_flag, take_switch};
use crate::error::Result;
use crate::style::{self, BOLD, DIM, GREEN, RESET, YELLOW};

/// Prints a running "blocks copied / blocks to copy" line when `-v` is
/// passed, matching spec.md §4.9's stated denominator of truth.
struct VerboseProgress {
    will_copy_total: u64,
    copied_total: u64,
    verbose: bool,
}

impl ProgressSink for VerboseProgress {
    fn event(&mut self, event: ProgressEvent) {
        if !self.verbose {
            return;
        }
        match event {
            ProgressEvent::WillCopyBlocks(n) => self.will_copy_total += n,
            ProgressEvent::DidCopyBlocks(n) => {
                self.copied_total += n;
                eprint!("\r  {DIM}copying...{RESET} {}/{} blocks", self.copied_total, self.will_copy_total);
            }
        }
    }
}

pub(crate) fn run(args: &[&str]) -> Result<()> {
    let (strict, args) = take_switch(args, "--strict");
    let (verbose, args) = take_switch(&args, "-v");
    let (verbose2, args) = take_switch(&args, "--verbose");
    let (encoding, args) = take_flag(&args, "--encoding");

    let source_path = next_arg(&args, 0, "source")?;
    let destination_path = next_arg(&args, 1, "destination")?;

    let default_script = parse_encoding(encoding)?;
    let options = ConvertOptions { default_script, strict_consistency: strict };

    let mut source = open_source(source_path)?;
    let mut destination = File::create(destination_path)?;

    style::header(&format!("Converting {source_path} -> {destination_path}"));
    style::kv("Source format", if source.is_hfs_plus { "HFS+ (nothing to convert)" } else { "HFS" });
    style::kv("Default encoding", &format!("{default_script:?}"));

    let mut progress = VerboseProgress { will_copy_total: 0, copied_total: 0, verbose: verbose || verbose2 };
    let cancel = NeverCancel;

    let report = pipeline::convert(&mut source, &mut destination, &options, &mut progress, &cancel)?;
    if progress.verbose {
        eprintln!();
    }

    println!();
    println!("  {BOLD}{GREEN}conversion complete{RESET}");
    style::kv("Files copied", &report.files_copied.to_string());
    style::kv("Folders created", &report.folders_created.to_string());
    style::kv("Blocks copied", &style::format_commas(report.blocks_copied));

    if !report.warnings.is_empty() {
        style::section("Warnings");
        for warning in &report.warnings {
            println!("  {YELLOW}-{RESET} {warning}");
        }
    }

    Ok(())
}

struct NeverCancel;
impl Cancellation for NeverCancel {}
