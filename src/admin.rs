//! Administrative reports backing the CLI's `stat`, `dump`, and `icheck`
//! tasks. Each function only reads state already exposed by [`crate::db::Engine`];
//! none of them reimplement core engine logic, matching the CLI's mandate to
//! be a thin reporting layer over the embedding API.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;

use crate::db::Engine;
use crate::error::Result;
use crate::types::VolumeId;

/// Snapshot of one volume's allocation state, for [`StatReport`].
#[derive(Clone, Debug, Serialize)]
pub struct VolumeStat {
    pub name: String,
    pub committed_pages: u64,
    pub maximum_pages: u64,
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub tree_count: usize,
}

/// Snapshot of the journal's running counters, for [`StatReport`].
#[derive(Clone, Debug, Serialize)]
pub struct JournalStat {
    pub frames_appended: u64,
    pub bytes_appended: u64,
    pub syncs: u64,
    pub coalesced_batches: u64,
    pub rollovers: u64,
}

/// Full point-in-time report produced by the `stat` task.
#[derive(Clone, Debug, Serialize)]
pub struct StatReport {
    pub buffer_pool_frames_in_use: usize,
    pub volumes: Vec<VolumeStat>,
    pub journal: JournalStat,
}

/// Repeats [`stat`] every `delay`, `count` times, calling `observe` with each
/// report. `count == 0` means run forever. Mirrors the CLI's `stat -r delay=S
/// count=N` repeating mode without the CLI owning any of the sampling logic
/// itself.
pub fn stat_loop(engine: &Engine, delay: Duration, count: u32, mut observe: impl FnMut(&StatReport)) -> Result<()> {
    let mut remaining = count;
    loop {
        observe(&stat(engine)?);
        if count != 0 {
            remaining -= 1;
            if remaining == 0 {
                return Ok(());
            }
        }
        std::thread::sleep(delay);
    }
}

/// One-shot point-in-time report: buffer pool occupancy, per-volume
/// allocation counters, and journal write counters.
pub fn stat(engine: &Engine) -> Result<StatReport> {
    let mut volumes = Vec::new();
    for volume in engine.volume_ids() {
        let spec = engine.volume_spec(volume)?;
        let stats = engine.volume_stats(volume)?;
        let (committed_pages, maximum_pages) = engine.volume_committed_pages(volume)?;
        let tree_count = engine.tree_names(volume)?.len();
        volumes.push(VolumeStat {
            name: spec.name,
            committed_pages,
            maximum_pages,
            pages_allocated: stats.pages_allocated,
            pages_freed: stats.pages_freed,
            tree_count,
        });
    }

    let journal_stats = engine.journal().stats();
    let journal = JournalStat {
        frames_appended: journal_stats.frames_appended.load(Ordering::Relaxed),
        bytes_appended: journal_stats.bytes_appended.load(Ordering::Relaxed),
        syncs: journal_stats.syncs.load(Ordering::Relaxed),
        coalesced_batches: journal_stats.coalesced_batches.load(Ordering::Relaxed),
        rollovers: journal_stats.rollovers.load(Ordering::Relaxed),
    };

    Ok(StatReport { buffer_pool_frames_in_use: engine.pool().len(), volumes, journal })
}

/// One tree's entry in a [`DumpReport`].
#[derive(Clone, Debug, Serialize)]
pub struct TreeDump {
    pub name: String,
    pub handle: u32,
    pub root_page: u64,
    pub depth: u32,
}

/// A volume's entry in a [`DumpReport`], optionally including its tree list.
#[derive(Clone, Debug, Serialize)]
pub struct VolumeDump {
    pub name: String,
    pub path: String,
    pub page_size: u32,
    pub committed_pages: u64,
    pub maximum_pages: u64,
    pub trees: Vec<TreeDump>,
}

/// Human-readable dump of every open volume and, if requested, its trees.
#[derive(Clone, Debug, Serialize)]
pub struct DumpReport {
    pub volumes: Vec<VolumeDump>,
}

/// Builds a [`DumpReport`]. `with_trees` corresponds to the CLI's `-p` flag
/// (include tree/page detail, not just volume headers).
pub fn dump(engine: &Engine, with_trees: bool) -> Result<DumpReport> {
    let mut volumes = Vec::new();
    for volume in engine.volume_ids() {
        let spec = engine.volume_spec(volume)?;
        let (committed_pages, maximum_pages) = engine.volume_committed_pages(volume)?;
        let trees = if with_trees {
            let mut entries = Vec::new();
            for name in engine.tree_names(volume)? {
                let tree = engine.open_tree(volume, &name, false)?;
                entries.push(TreeDump {
                    name: tree.name().to_string(),
                    handle: tree.handle().0,
                    root_page: tree.root_page().0,
                    depth: tree.depth(),
                });
            }
            entries
        } else {
            Vec::new()
        };
        volumes.push(VolumeDump {
            name: spec.name,
            path: engine.volume_path(volume)?.display().to_string(),
            page_size: spec.page_size,
            committed_pages,
            maximum_pages,
            trees,
        });
    }
    Ok(DumpReport { volumes })
}

/// Severity of a single [`icheck`] finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLevel {
    Warning,
    Error,
}

/// A single accumulated integrity fault. `icheck` keeps scanning after the
/// first fault rather than aborting, so a volume with several unrelated
/// problems reports all of them in one pass.
#[derive(Clone, Debug, Serialize)]
pub struct IntegrityFinding {
    pub volume: String,
    pub level: IntegrityLevel,
    pub message: String,
}

/// Result of an `icheck` pass over one or more volumes.
#[derive(Clone, Debug, Serialize)]
pub struct IntegrityReport {
    pub findings: Vec<IntegrityFinding>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        !self.findings.iter().any(|f| matches!(f.level, IntegrityLevel::Error))
    }
}

/// Checks every page a volume has committed is readable (checksum-verified on
/// read) and that every tree's recorded root page falls within the volume's
/// committed range. `volumes` empty means check every open volume.
pub fn icheck(engine: &Engine, volumes: &[VolumeId]) -> Result<IntegrityReport> {
    let targets: Vec<VolumeId> = if volumes.is_empty() { engine.volume_ids() } else { volumes.to_vec() };
    let mut findings = Vec::new();

    for volume in targets {
        let spec = engine.volume_spec(volume)?;
        let (committed_pages, maximum_pages) = engine.volume_committed_pages(volume)?;
        if committed_pages > maximum_pages {
            findings.push(IntegrityFinding {
                volume: spec.name.clone(),
                level: IntegrityLevel::Error,
                message: format!("committed pages {committed_pages} exceed configured maximum {maximum_pages}"),
            });
        }

        for name in engine.tree_names(volume)? {
            match engine.open_tree(volume, &name, false) {
                Ok(tree) => {
                    if tree.root_page().0 >= committed_pages && tree.root_page().0 != 0 {
                        findings.push(IntegrityFinding {
                            volume: spec.name.clone(),
                            level: IntegrityLevel::Error,
                            message: format!("tree '{name}' root page {} outside committed range", tree.root_page().0),
                        });
                    }
                }
                Err(err) => {
                    findings.push(IntegrityFinding {
                        volume: spec.name.clone(),
                        level: IntegrityLevel::Error,
                        message: format!("tree '{name}' failed to open: {err}"),
                    });
                }
            }
        }
    }

    Ok(IntegrityReport { findings })
}
