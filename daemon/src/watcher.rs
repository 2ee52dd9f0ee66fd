//! inotify assistance: directories that ask for it are watched so a new
//! file gets them scanned before their regular deadline, and `etc/` is
//! watched for configuration edits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use common::RuleSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Something appeared in the directory with this id.
    Directory(u32),
    Config,
}

fn is_config_name(name: &str) -> bool {
    name.starts_with("DIR_CONFIG") || name.starts_with("AFD_CONFIG")
}

/// Maps one changed path to what it means for the supervisor.
pub fn classify(path: &Path, watched: &HashMap<PathBuf, u32>, etc_dir: &Path) -> Option<Change> {
    let parent = path.parent()?;
    let name = path.file_name()?.to_str()?;
    if parent == etc_dir {
        return is_config_name(name).then_some(Change::Config);
    }
    if name.starts_with('.') {
        return None;
    }
    watched.get(parent).map(|&id| Change::Directory(id))
}

fn relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    pub watched: usize,
}

impl DirWatcher {
    /// Starts watching every inotify directory of `rules` plus `etc_dir`.
    pub fn start(rules: &RuleSet, etc_dir: &Path, tx: UnboundedSender<Change>) -> Result<Self> {
        let dirs: HashMap<PathBuf, u32> = rules
            .dirs
            .iter()
            .filter(|d| d.inotify)
            .map(|d| (d.path.clone(), d.dir_id))
            .collect();
        let etc = etc_dir.to_path_buf();
        let map = dirs.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if relevant(&event.kind) => {
                for path in &event.paths {
                    if let Some(change) = classify(path, &map, &etc) {
                        let _ = tx.send(change);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Watch error: {}", e),
        })
        .context("Failed to create file system watcher")?;

        watcher
            .watch(etc_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", etc_dir.display()))?;
        let mut watched = 0;
        for path in dirs.keys() {
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => log::warn!("Failed to watch {}: {}", path.display(), e),
            }
        }
        log::info!("Watching {} directories for new files", watched);
        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }
}
