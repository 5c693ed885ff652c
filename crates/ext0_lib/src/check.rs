//! Offline consistency check of a volume.
//!
//! Nothing is repaired. Problems that lose or corrupt data are errors; counters that are only
//! refreshed on sync, or stale replicas, are warnings.

use std::collections::HashMap;

use log::debug;

use crate::dir::DirEntry;
use crate::error::Result;
use crate::inode::Inode;
use crate::node::Node;
use crate::superblock::SuperBlock;
use crate::translate::{self, read_block_bitmap};
use crate::types::{EXT0_MAGIC, GroupIndex, ROOT_GROUP, ROOT_INO};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub groups_checked: u32,
    pub live_entities: u32,
    pub directories: u32,
    pub entries: u32,
}

impl Report {
    fn error(&mut self, message: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Error,
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    /// No errors. Warnings are allowed.
    pub fn is_clean(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Runs every check against a mounted volume. Only device read failures end the run early;
/// everything else is recorded and the check goes on.
pub fn check(volume: &Volume) -> Result<Report> {
    let mut report = Report {
        groups_checked: volume.groups_count(),
        ..Report::default()
    };
    let primary = volume.superblock();

    check_replicas(volume, &primary, &mut report)?;
    let inodes = check_groups(volume, &mut report)?;
    check_tree(volume, &inodes, &mut report)?;
    check_counters(volume, &primary, &mut report);

    debug!(
        "check finished: {} errors, {} warnings",
        report.errors().count(),
        report.warnings().count()
    );
    Ok(report)
}

fn check_replicas(volume: &Volume, primary: &SuperBlock, report: &mut Report) -> Result<()> {
    let bitmap = volume.bitmap();
    for g in 0..volume.groups_count() {
        let group = GroupIndex::new(g);
        let block = volume.geometry().superblock_block(group);
        let raw = volume.device().read_block_vec(block)?;
        let (sb, replica_bitmap) = match SuperBlock::decode(&raw).map_err(|err| err.at_block(block)) {
            Ok(parsed) => parsed,
            Err(err) => {
                report.error(format!("superblock replica of {group} is unreadable: {err}"));
                continue;
            }
        };
        if sb.magic != EXT0_MAGIC {
            report.error(format!(
                "superblock replica of {group} has magic {:#06x}",
                sb.magic
            ));
            continue;
        }
        if !sb.same_globals(primary) {
            report.error(format!(
                "superblock replica of {group} disagrees with the primary"
            ));
        }
        if u32::from(sb.block_group_nr) != g {
            report.warn(format!(
                "superblock replica of {group} is numbered {}",
                sb.block_group_nr
            ));
        }
        if !group.is_root() && replica_bitmap != bitmap {
            report.warn(format!("inode bitmap in the replica of {group} is stale"));
        }
    }
    Ok(())
}

/// Per-group checks. Returns the inodes of live entities.
fn check_groups(volume: &Volume, report: &mut Report) -> Result<HashMap<GroupIndex, Inode>> {
    let geometry = volume.geometry();
    let bitmap = volume.bitmap();
    let mut live = HashMap::new();
    for g in 0..volume.groups_count() {
        let group = GroupIndex::new(g);
        let desc = volume.descriptor(group)?;
        if !desc.matches_layout(geometry, group) {
            report.error(format!("descriptor of {group} does not match the layout: {desc:?}"));
            continue;
        }
        let inode = match volume.read_inode(group) {
            Ok(inode) => inode,
            Err(err) => {
                report.error(format!("inode of {group} is unreadable: {err}"));
                continue;
            }
        };
        let allocated = bitmap.is_set(g as usize);
        let (used_prefix, stray) = read_block_bitmap(volume.device(), &desc, geometry.direct_blocks)?;

        if !allocated {
            if inode.is_live() {
                report.error(format!(
                    "{group} holds a live inode but its bitmap bit is clear"
                ));
            }
            if usize::from(desc.free_blocks_count) != geometry.direct_blocks || used_prefix != 0 {
                report.warn(format!("free {group} still accounts for used blocks"));
            }
            continue;
        }
        if !inode.is_live() {
            report.error(format!(
                "{group} is allocated but its inode is released (dtime {}, mode {:o})",
                inode.dtime, inode.mode
            ));
            continue;
        }

        if inode.blocks as usize > geometry.direct_blocks {
            report.error(format!("inode {} maps {} blocks", group.ino(), inode.blocks));
            continue;
        }
        // special nodes keep rdev in block[0] with nothing mapped, so they pass trivially
        let pointers_valid = inode.mapped_blocks().iter().enumerate().all(|(k, pointer)| {
            translate::lookup(&desc, &inode, k as u64)
                .is_ok_and(|physical| physical == u64::from(*pointer))
        });
        if !pointers_valid {
            report.error(format!(
                "inode {} has direct pointers outside its group",
                group.ino()
            ));
        }
        if used_prefix != inode.blocks || stray {
            report.error(format!(
                "block bitmap of {group} does not match the {} mapped blocks of inode {}",
                inode.blocks,
                group.ino()
            ));
        }
        if usize::from(desc.free_blocks_count) + inode.blocks as usize != geometry.direct_blocks {
            report.error(format!(
                "descriptor of {group} counts {} free blocks, inode {} maps {}",
                desc.free_blocks_count,
                group.ino(),
                inode.blocks
            ));
        }
        if u64::from(inode.size) > u64::from(inode.blocks) * geometry.block_size as u64
            && inode.is_dir()
        {
            report.error(format!(
                "directory {} is {} bytes but maps only {} blocks",
                group.ino(),
                inode.size,
                inode.blocks
            ));
        }
        live.insert(group, inode);
    }
    report.live_entities = live.len() as u32;
    Ok(live)
}

/// Walks every directory: entries must point at live entities and every entity's link count
/// must equal the number of entries naming it.
fn check_tree(
    volume: &Volume,
    inodes: &HashMap<GroupIndex, Inode>,
    report: &mut Report,
) -> Result<()> {
    match inodes.get(&ROOT_GROUP) {
        Some(root) if root.is_dir() => {}
        _ => {
            report.error("the root is not a live directory");
            return Ok(());
        }
    }

    let mut references: HashMap<GroupIndex, u32> = HashMap::new();
    let mut dirs: Vec<_> = inodes
        .iter()
        .filter(|(_, inode)| inode.is_dir())
        .map(|(group, _)| *group)
        .collect();
    dirs.sort_unstable();

    for group in dirs {
        report.directories += 1;
        let entries = match volume.node(group.ino()).and_then(Node::into_dir) {
            Ok(dir) => match dir.entries() {
                Ok(entries) => entries,
                Err(err) => {
                    report.error(format!("directory {} is unreadable: {err}", group.ino()));
                    continue;
                }
            },
            Err(err) => {
                report.error(format!("directory {} cannot be opened: {err}", group.ino()));
                continue;
            }
        };
        check_dot_entries(group, &entries, report);
        for entry in entries {
            report.entries += 1;
            match GroupIndex::from_ino(u64::from(entry.inode)).filter(|g| inodes.contains_key(g)) {
                Some(target) => *references.entry(target).or_default() += 1,
                None => report.error(format!(
                    "entry '{}' in directory {} points at unallocated inode {}",
                    entry.name_lossy(),
                    group.ino(),
                    entry.inode
                )),
            }
        }
    }

    let mut groups: Vec<_> = inodes.keys().copied().collect();
    groups.sort_unstable();
    for group in groups {
        let links = inodes[&group].links_count;
        let named = references.get(&group).copied().unwrap_or(0);
        if named == 0 {
            report.error(format!("inode {} is allocated but no entry names it", group.ino()));
        } else if u32::from(links) != named {
            report.warn(format!(
                "inode {} has link count {links}, {named} entries name it",
                group.ino()
            ));
        }
    }
    Ok(())
}

fn check_dot_entries(group: GroupIndex, entries: &[DirEntry], report: &mut Report) {
    let dot = entries.iter().find(|e| e.name == b".");
    let dotdot = entries.iter().find(|e| e.name == b"..");
    if dot.map(|e| u64::from(e.inode)) != Some(group.ino()) {
        report.error(format!("directory {} has a missing or wrong '.'", group.ino()));
    }
    match dotdot {
        None => report.error(format!("directory {} has no '..'", group.ino())),
        Some(e) if group.is_root() && u64::from(e.inode) != ROOT_INO => {
            report.error(format!("'..' of the root points at inode {}", e.inode))
        }
        Some(_) => {}
    }
}

fn check_counters(volume: &Volume, primary: &SuperBlock, report: &mut Report) {
    let stat = volume.statfs();
    if u64::from(primary.free_inodes_count) != stat.free_files {
        report.warn(format!(
            "superblock counts {} free inodes, the bitmap has {}",
            primary.free_inodes_count, stat.free_files
        ));
    }
    if u64::from(primary.free_blocks_count) != stat.free_blocks {
        report.warn(format!(
            "superblock counts {} free blocks, the descriptors have {}",
            primary.free_blocks_count, stat.free_blocks
        ));
    }
}
