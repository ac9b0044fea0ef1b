//! `hfsconv list <source> [path] [--long]` -- list a directory's immediate
//! children (spec.md §6 "list"). Bare invocation lists the volume root.

use hfsconv::catalog::{CatalogRecord, CNID_ROOT_FOLDER};
use hfsconv::EntryKind;

use crate::cli::{next_arg, open_source, take_switch};
use crate::error::{CliError, Result};
use crate::style::{self, DIM, RESET};

pub(crate) fn run(args: &[&str]) -> Result<()> {
    let (long, args) = take_switch(args, "--long");
    let path = next_arg(&args, 0, "source")?;
    let target_path = args.get(1).copied().unwrap_or("");

    let mut source = open_source(path)?;

    let parent_cnid = if target_path.is_empty() {
        CNID_ROOT_FOLDER
    } else {
        match source.resolve(target_path)? {
            CatalogRecord::Folder(f) => f.folder_id,
            CatalogRecord::File(_) => return Err(CliError::Hfs(hfsconv::Error::NotADirectory(target_path.to_string()))),
            _ => unreachable!("thread records never escape resolve()"),
        }
    };

    let mut entries = source.list_directory(parent_cnid)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    style::header(&format!("{path}:/{}", target_path.trim_start_matches('/')));
    for entry in &entries {
        let icon = style::kind_icon(entry.kind);
        let color = style::kind_color(entry.kind);
        if long {
            let size = if entry.kind == EntryKind::Directory { "-".to_string() } else { style::format_commas(entry.size) };
            println!("  [{icon}] {color}{:<32}{RESET} {DIM}{size:>14}{RESET}  cnid={}", entry.name, entry.cnid);
        } else {
            println!("  [{icon}] {color}{}{RESET}", entry.name);
        }
    }
    println!();
    println!("  {DIM}{} item(s){RESET}", entries.len());

    Ok(())
}
