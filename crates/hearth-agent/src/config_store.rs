//! Persisted orchestrator configuration (`config.json`).
//!
//! The store is the only writer of the document. Everyone else works from
//! [`ConfigStore::snapshot`] copies and routes changes through
//! [`ConfigStore::update`].

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub seed: String,
    pub gamemode: String,
    pub difficulty: String,
    pub max_players: u32,
    pub motd: String,
    pub pvp: bool,
    pub enable_command_block: bool,
    pub allow_nether: bool,
    pub allow_end: bool,
    pub spawn_protection: u32,
    pub view_distance: u32,
    pub simulation_distance: u32,
    pub level_name: String,
    pub online_mode: bool,
    pub white_list: bool,
    pub require_resource_pack: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            seed: String::new(),
            gamemode: "survival".to_string(),
            difficulty: "normal".to_string(),
            max_players: 20,
            motd: "A Hearth Minecraft Server".to_string(),
            pvp: true,
            enable_command_block: false,
            allow_nether: true,
            allow_end: true,
            spawn_protection: 16,
            view_distance: 10,
            simulation_distance: 10,
            level_name: "world".to_string(),
            online_mode: false,
            white_list: false,
            require_resource_pack: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceSettings {
    pub min_ram: String,
    pub max_ram: String,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            min_ram: "1G".to_string(),
            max_ram: "2G".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelSettings {
    pub auto_start: bool,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self { auto_start: true }
    }
}

/// Which seed the on-disk world was generated from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldTracking {
    pub current_seed: String,
    pub last_used_seed: String,
    pub world_generated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub world: WorldTracking,
}

/// On-disk shape; `world` is absent in legacy documents.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredConfig {
    #[serde(default)]
    server: ServerSettings,
    #[serde(default)]
    performance: PerformanceSettings,
    #[serde(default)]
    tunnel: TunnelSettings,
    world: Option<WorldTracking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Existing,
    Migrated,
    CreatedDefault,
    FallbackDefault,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<ServerConfig>,
    // Serializes writers so two updates can't interleave their read-modify-write.
    write_lock: Mutex<()>,
    load_warning: Mutex<Option<String>>,
    source: LoadSource,
}

impl ConfigStore {
    /// Loads `path`, creating, migrating or falling back to defaults as needed.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (config, source, warning) = match read_document(&path) {
            Ok(Some(stored)) => match stored.world {
                Some(world) => (
                    ServerConfig {
                        server: stored.server,
                        performance: stored.performance,
                        tunnel: stored.tunnel,
                        world,
                    },
                    LoadSource::Existing,
                    None,
                ),
                None => {
                    let config = migrate_legacy(stored);
                    let warning = write_document(&path, &config)
                        .err()
                        .map(|e| format!("config migrated in memory but not saved: {e}"));
                    tracing::info!(path = %path.display(), "migrated legacy config: added world tracking");
                    (config, LoadSource::Migrated, warning)
                }
            },
            Ok(None) => {
                let config = ServerConfig::default();
                let warning = write_document(&path, &config)
                    .err()
                    .map(|e| format!("default config could not be written: {e}"));
                tracing::info!(path = %path.display(), "created default config");
                (config, LoadSource::CreatedDefault, warning)
            }
            Err(e) => (
                ServerConfig::default(),
                LoadSource::FallbackDefault,
                Some(format!("config unreadable, using defaults: {e}")),
            ),
        };

        if let Some(w) = &warning {
            tracing::warn!(path = %path.display(), "{w}");
        }

        Self {
            path,
            current: RwLock::new(config),
            write_lock: Mutex::new(()),
            load_warning: Mutex::new(warning),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_source(&self) -> LoadSource {
        self.source
    }

    /// One-shot: the warning produced while loading, if any.
    pub fn take_load_warning(&self) -> Option<String> {
        self.load_warning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn snapshot(&self) -> ServerConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persists `config` as-is and makes it the current snapshot.
    pub fn save(&self, config: ServerConfig) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_document(&self.path, &config)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Read-modify-write against the latest snapshot.
    ///
    /// `world.current_seed` always follows `server.seed` afterwards.
    pub fn update<F>(&self, f: F) -> Result<ServerConfig, ConfigError>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.snapshot();
        f(&mut next);
        next.world.current_seed = next.server.seed.clone();
        write_document(&self.path, &next)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        Ok(next)
    }
}

fn migrate_legacy(stored: StoredConfig) -> ServerConfig {
    // Legacy installs ran before world tracking existed; their world is already on disk.
    let seed = stored.server.seed.clone();
    ServerConfig {
        server: stored.server,
        performance: stored.performance,
        tunnel: stored.tunnel,
        world: WorldTracking {
            current_seed: seed.clone(),
            last_used_seed: seed,
            world_generated: true,
        },
    }
}

fn read_document(path: &Path) -> Result<Option<StoredConfig>, ConfigError> {
    let raw = match std::fs::read(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice::<StoredConfig>(&raw)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_document(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let data = serde_json::to_vec_pretty(config)
        .map_err(|e| write_err(std::io::Error::other(e)))?;
    let tmp = path.with_extension("json.tmp");
    let mut f = std::fs::File::create(&tmp).map_err(write_err)?;
    f.write_all(&data).map_err(write_err)?;
    f.sync_all().map_err(write_err)?;
    drop(f);
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}
