//! Argument helpers shared by every subcommand: `--encoding`, opening a
//! source image (probing it for a partition map first), and a plain
//! positional-argument reader matching the teacher's manual `match`-based
//! parsing (no `clap`).

use std::fs::File;

use hfsconv::encoding::ScriptCode;
use hfsconv::probe::{self, PartitionInfo};
use hfsconv::volume::SourceVolume;

use crate::error::{CliError, Result};

/// Parse `--encoding <name-or-number>` the way spec.md's external command
/// surface describes it: a known script name (case-insensitive) or a raw
/// numeric script code. Defaults to MacRoman when absent.
pub(crate) fn parse_encoding(value: Option<&str>) -> Result<ScriptCode> {
    let Some(value) = value else {
        return Ok(ScriptCode::Roman);
    };
    if let Ok(code) = value.parse::<u8>() {
        return Ok(ScriptCode::from_u8(code));
    }
    let script = match value.to_ascii_lowercase().as_str() {
        "roman" | "macroman" => ScriptCode::Roman,
        "japanese" => ScriptCode::Japanese,
        "tradchinese" | "traditionalchinese" => ScriptCode::TradChinese,
        "korean" => ScriptCode::Korean,
        "arabic" => ScriptCode::Arabic,
        "hebrew" => ScriptCode::Hebrew,
        "greek" => ScriptCode::Greek,
        "cyrillic" => ScriptCode::Cyrillic,
        "simpchinese" | "simplifiedchinese" => ScriptCode::SimpChinese,
        "thai" => ScriptCode::Thai,
        _ => return Err(CliError::UnknownEncoding(value.to_string())),
    };
    Ok(script)
}

/// Probe `path` for an HFS/HFS+ candidate partition and open a
/// [`SourceVolume`] on the first one found. Bare (unpartitioned) images
/// and Apple Partition Map images are both handled transparently.
pub(crate) fn open_source(path: &str) -> Result<SourceVolume<File>> {
    let mut file = File::open(path)?;
    let partitions = probe::probe(&mut file)?;
    let candidate: Option<&PartitionInfo> = partitions.iter().find(|p| p.is_hfs_candidate);
    let Some(candidate) = candidate else {
        return Err(CliError::NoHfsPartition(path.to_string()));
    };
    Ok(SourceVolume::open(file, candidate.start_offset)?)
}

/// Take the next positional argument, erroring with a named placeholder
/// when the caller didn't supply one.
pub(crate) fn next_arg<'a>(args: &[&'a str], index: usize, name: &'static str) -> Result<&'a str> {
    args.get(index).copied().ok_or(CliError::MissingArgument(name))
}

/// Pull a `--flag value` pair out of an argument list, returning the value
/// and the remaining positional arguments with the flag and its value
/// removed.
pub(crate) fn take_flag<'a>(args: &[&'a str], flag: &str) -> (Option<&'a str>, Vec<&'a str>) {
    let mut value = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            value = args.get(i + 1).copied();
            i += 2;
        } else {
            rest.push(args[i]);
            i += 1;
        }
    }
    (value, rest)
}

/// Pull a bare `--flag` switch out of an argument list, returning whether
/// it was present and the remaining positional arguments.
pub(crate) fn take_switch<'a>(args: &[&'a str], flag: &str) -> (bool, Vec<&'a str>) {
    let mut present = false;
    let mut rest = Vec::with_capacity(args.len());
    for &arg in args {
        if arg == flag {
            present = true;
        } else {
            rest.push(arg);
        }
    }
    (present, rest)
}
