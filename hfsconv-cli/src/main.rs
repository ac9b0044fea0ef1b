//! hfsconv-cli -- analyze, list, extract, archive, and convert HFS and
//! HFS+ volume images.
//!
//! # Usage
//!
//! ```text
//! hfsconv analyze <source> [--check]                         Volume header, B*-tree sizing, orphan scan
//! hfsconv list <source> [path] [--long]                       List a directory's contents
//! hfsconv extract <source> <path> [--resource] [--out file]   Extract one item's fork to a file or stdout
//! hfsconv archive <host-dir> <destination> [--name vol]       Build an HFS+ image from a host directory
//! hfsconv convert <source> <destination> [--encoding enc] [--strict] [-v]
//!                                                              Convert HFS to HFS+
//! ```

mod cli;
mod cmd_analyze;
mod cmd_archive;
mod cmd_convert;
mod cmd_extract;
mod cmd_list;
mod error;
mod style;

use std::env;
use std::process;

use style::{BOLD, DIM, GREEN, RED, RESET};

fn main() {
    let args: Vec<String> = env::args().collect();
    let rest: Vec<&str> = args.iter().skip(2).map(String::as_str).collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "analyze" => cmd_analyze::run(&rest),
        "list" => cmd_list::run(&rest),
        "extract" => cmd_extract::run(&rest),
        "archive" => cmd_archive::run(&rest),
        "convert" => cmd_convert::run(&rest),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("{RED}Unknown command: {other}{RESET}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}hfsconv{RESET} -- HFS / HFS+ volume toolkit

{DIM}List, analyze, extract from, archive into, and convert classic Macintosh volume images{RESET}

{BOLD}USAGE:{RESET}
    hfsconv <COMMAND> [OPTIONS]

{BOLD}COMMANDS:{RESET}
    {GREEN}analyze{RESET}  <source> [--check]                        Volume header, B*-tree sizing, orphan scan
    {GREEN}list{RESET}     <source> [path] [--long]                  List a directory's contents
    {GREEN}extract{RESET}  <source> <path> [--resource] [--out f]    Extract one item's fork
    {GREEN}archive{RESET}  <host-dir> <destination> [--name vol]     Build an HFS+ image from a host directory
    {GREEN}convert{RESET}  <source> <destination> [--encoding enc]   Convert HFS to HFS+
             [--strict] [-v]

{BOLD}EXAMPLES:{RESET}
    hfsconv analyze MacVolume.img --check
    hfsconv list MacVolume.img /Documents --long
    hfsconv extract MacVolume.img /Documents/Report --out Report.bin
    hfsconv convert MacVolume.img MacVolume.hfs.img -v
    hfsconv archive ./my-folder NewVolume.img --name "My Volume"
"#
    );
}
