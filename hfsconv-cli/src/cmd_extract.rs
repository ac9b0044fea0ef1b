//! `hfsconv extract <source> <path> [--resource] [--out <file>]` --
//! rehydrate a single item's fork bytes to a host file or stdout
//! (spec.md §1 "extraction (rehydration)").

use std::fs::File;
use std::io::{self, Write};

use crate::cli::{next_arg, open_source, take_flag, take_switch};
use crate::error::Result;
use crate::style;

pub(crate) fn run(args: &[&str]) -> Result<()> {
    let (resource, args) = take_switch(args, "--resource");
    let (out, args) = take_flag(&args, "--out");

    let source_path = next_arg(&args, 0, "source")?;
    let item_path = next_arg(&args, 1, "path")?;

    let mut source = open_source(source_path)?;

    let written = match out {
        Some(out_path) => {
            let mut file = File::create(out_path)?;
            source.read_file_to(item_path, resource, &mut file)?
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            let written = source.read_file_to(item_path, resource, &mut lock)?;
            lock.flush()?;
            written
        }
    };

    if out.is_some() {
        eprintln!("  extracted {} ({})", item_path, style::format_size(written));
    }

    Ok(())
}
