//! Decides whether the world must be regenerated before a start, and moves the
//! old world into a backup when the seed changed.
//!
//! Invariant: a failed backup never removes anything from the live world.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::Serialize;

use crate::config_store::{ConfigError, ConfigStore, ServerConfig};
use crate::process_manager_support::format_error_chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NoWorldExists,
    SeedChanged,
    SeedUnchanged,
    BackupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldDecision {
    pub should_create_new: bool,
    pub reason: DecisionReason,
    pub backup_name: Option<String>,
    /// Error chain when `reason` is `BackupFailed`.
    pub error: Option<String>,
    /// Set when the decision was made but world tracking could not be saved.
    pub tracking_error: Option<String>,
}

impl WorldDecision {
    fn new(should_create_new: bool, reason: DecisionReason) -> Self {
        Self {
            should_create_new,
            reason,
            backup_name: None,
            error: None,
            tracking_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorldGuard {
    store: Arc<ConfigStore>,
    server_dir: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl WorldGuard {
    pub fn new(store: Arc<ConfigStore>, server_dir: PathBuf, backup_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            server_dir,
            backup_dir,
        }
    }

    pub fn world_dir(&self, config: &ServerConfig) -> PathBuf {
        self.server_dir.join(level_dir_name(config))
    }

    fn backup_root(&self) -> &Path {
        self.backup_dir.as_deref().unwrap_or(&self.server_dir)
    }

    /// Evaluates against the current snapshot and what is on disk.
    pub fn evaluate_current(&self) -> WorldDecision {
        let config = self.store.snapshot();
        let exists = self.world_dir(&config).is_dir();
        self.evaluate(&config, exists)
    }

    pub fn evaluate(&self, config: &ServerConfig, world_exists: bool) -> WorldDecision {
        if !world_exists {
            let seed = config.server.seed.clone();
            let saved = self.store.update(|cfg| {
                cfg.world.current_seed = seed.clone();
                cfg.world.last_used_seed = seed;
                cfg.world.world_generated = false;
            });
            return WorldDecision {
                tracking_error: tracking_error(saved),
                ..WorldDecision::new(true, DecisionReason::NoWorldExists)
            };
        }

        let tracking = &config.world;
        if tracking.current_seed == tracking.last_used_seed {
            return WorldDecision::new(false, DecisionReason::SeedUnchanged);
        }

        let world = self.world_dir(config);
        match backup_world(&world, self.backup_root(), &level_dir_name(config)) {
            Ok(backup_name) => {
                tracing::info!(
                    world = %world.display(),
                    backup = %backup_name,
                    from = %tracking.last_used_seed,
                    to = %tracking.current_seed,
                    "seed changed: world backed up for regeneration"
                );
                let seed = tracking.current_seed.clone();
                let saved = self.store.update(|cfg| {
                    cfg.world.last_used_seed = seed;
                    cfg.world.world_generated = false;
                });
                WorldDecision {
                    backup_name: Some(backup_name),
                    tracking_error: tracking_error(saved),
                    ..WorldDecision::new(true, DecisionReason::SeedChanged)
                }
            }
            Err(e) => {
                let msg = format_error_chain(&e);
                tracing::error!(world = %world.display(), error = %msg, "world backup failed; keeping existing world");
                WorldDecision {
                    error: Some(msg),
                    ..WorldDecision::new(false, DecisionReason::BackupFailed)
                }
            }
        }
    }

    /// Records that the managed process finished generating the world.
    pub fn mark_generated(&self) -> Result<(), ConfigError> {
        self.store
            .update(|cfg| cfg.world.world_generated = true)
            .map(|_| ())
            .inspect_err(|e| tracing::warn!(error = %e, "failed to persist world tracking"))
    }
}

fn tracking_error(saved: Result<ServerConfig, ConfigError>) -> Option<String> {
    let e = saved.err()?;
    tracing::warn!(error = %e, "failed to persist world tracking");
    Some(e.to_string())
}

fn level_dir_name(config: &ServerConfig) -> String {
    let name = config.server.level_name.trim();
    if name.is_empty() {
        "world".to_string()
    } else {
        name.to_string()
    }
}

/// Copies `world` into a fresh directory under `backup_root`, then removes `world`.
///
/// Returns the backup directory's name.
pub fn backup_world(world: &Path, backup_root: &Path, level_name: &str) -> anyhow::Result<String> {
    if backup_root.starts_with(world) {
        anyhow::bail!(
            "backup root {} is inside the world directory",
            backup_root.display()
        );
    }
    let (backup_name, backup_path) = claim_backup_dir(backup_root, level_name)?;

    if let Err(e) = copy_tree(world, &backup_path) {
        let _ = fs::remove_dir_all(&backup_path);
        return Err(e.context(format!("copy world into {}", backup_path.display())));
    }

    discard_world(world)?;
    Ok(backup_name)
}

fn claim_backup_dir(backup_root: &Path, level_name: &str) -> anyhow::Result<(String, PathBuf)> {
    fs::create_dir_all(backup_root)
        .with_context(|| format!("create backup root {}", backup_root.display()))?;

    let now = chrono::Local::now();
    let base = format!("{level_name}_backup_{}", now.format("%Y-%m-%d_%H-%M-%S"));
    let fine = format!("{base}_{}", now.format("%3f"));
    let candidates = [base, fine.clone()]
        .into_iter()
        .chain((1..=100).map(|n| format!("{fine}_{n}")));

    for name in candidates {
        let path = backup_root.join(&name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok((name, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create backup dir {}", path.display()));
            }
        }
    }
    anyhow::bail!(
        "no free backup name for {level_name} under {}",
        backup_root.display()
    )
}

/// Iterative copy of `src` into the existing directory `dst`.
///
/// Symlinks are recreated, never followed, so link cycles cannot recurse.
fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = stack.pop() {
        let entries =
            fs::read_dir(&from_dir).with_context(|| format!("read dir {}", from_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir {}", from_dir.display()))?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", from.display()))?;

            if file_type.is_symlink() {
                copy_symlink(&from, &to)?;
            } else if file_type.is_dir() {
                fs::create_dir(&to).with_context(|| format!("create dir {}", to.display()))?;
                stack.push((from, to));
            } else if file_type.is_file() {
                fs::copy(&from, &to)
                    .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
            } else {
                anyhow::bail!("unsupported file type at {}", from.display());
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> anyhow::Result<()> {
    let target = fs::read_link(from).with_context(|| format!("read link {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("create link {}", to.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, _to: &Path) -> anyhow::Result<()> {
    anyhow::bail!("refusing to back up symlink {}", from.display())
}

/// Moves `world` aside atomically, then deletes it.
///
/// Only the rename can fail the backup; a leftover staging dir is logged.
fn discard_world(world: &Path) -> anyhow::Result<()> {
    let parent = world.parent().unwrap_or_else(|| Path::new("."));
    let name = world
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "world".to_string());
    let staging = parent.join(format!(
        ".{name}.discarding-{}",
        chrono::Local::now().format("%Y%m%d%H%M%S%3f")
    ));

    fs::rename(world, &staging).with_context(|| {
        format!(
            "move {} aside to {}",
            world.display(),
            staging.display()
        )
    })?;

    if let Err(e) = fs::remove_dir_all(&staging) {
        tracing::warn!(path = %staging.display(), error = %e, "old world copy left on disk");
    }
    Ok(())
}
