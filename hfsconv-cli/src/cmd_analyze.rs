//! `hfsconv analyze <source>` -- volume header, B*-tree sizing, and an
//! optional full consistency pass (spec.md §4.10, §6 "analyze").

use crate::cli::{next_arg, open_source, take_switch};
use crate::error::Result;
use crate::style::{self, BOLD, GREEN, RED, RESET, YELLOW};

pub(crate) fn run(args: &[&str]) -> Result<()> {
    let (check, args) = take_switch(args, "--check");
    let path = next_arg(&args, 0, "source")?;

    let mut source = open_source(path)?;

    style::header(&format!("{} ({})", path, if source.is_hfs_plus { if source.is_hfsx { "HFS+X" } else { "HFS+" } } else { "HFS" }));

    style::section("Volume header");
    style::kv("Volume name", &source.volume_name);
    style::kv("Block size", &style::format_size(source.block_size as u64));
    style::kv("Total blocks", &style::format_commas(source.total_blocks as u64));
    style::kv("Free blocks", &style::format_commas(source.free_blocks as u64));
    style::kv("File count", &style::format_commas(source.file_count as u64));
    style::kv("Folder count", &style::format_commas(source.folder_count as u64));
    style::kv("Next CNID", &source.next_cnid.to_string());
    style::kv("Created", &style::format_hfs_date(source.create_date));
    style::kv("Modified", &style::format_hfs_date(source.modify_date));

    style::section("Catalog B*-tree");
    style::kv("Tree depth", &source.catalog_btree_header.tree_depth.to_string());
    style::kv("Leaf records", &style::format_commas(source.catalog_btree_header.leaf_records as u64));
    style::kv("Node size", &style::format_size(source.catalog_btree_header.node_size as u64));
    style::kv("Nodes (live / potential)", &format!("{} / {}", source.catalog_btree_header.live_node_count(), source.catalog_btree_header.potential_node_count()));

    style::section("Extents overflow B*-tree");
    style::kv("Tree depth", &source.extents_btree_header.tree_depth.to_string());
    style::kv("Leaf records", &style::format_commas(source.extents_btree_header.leaf_records as u64));
    style::kv("Nodes (live / potential)", &format!("{} / {}", source.extents_btree_header.live_node_count(), source.extents_btree_header.potential_node_count()));

    style::section("Block recovery");
    let orphaned = source.orphaned_block_count()?;
    style::kv("Allocated but unread this run", &source.unread_allocated_block_count().to_string());
    style::kv("Allocated but unreferenced", &orphaned.to_string());
    if orphaned > 0 {
        style::warn(&format!("{orphaned} block(s) are marked allocated but claimed by no catalog or extents record -- recoverable only by raw scan, not by conversion"));
    }

    if check {
        style::section("Consistency check");
        let warnings = hfsconv::consistency::check_volume(&mut source)?;
        if warnings.is_empty() {
            println!("  {GREEN}{BOLD}no inconsistencies found{RESET}");
        } else {
            for warning in &warnings {
                println!("  {YELLOW}-{RESET} {warning}");
            }
            println!();
            println!("  {RED}{BOLD}{} inconsistency(ies) found{RESET}", warnings.len());
        }
    }

    Ok(())
}
