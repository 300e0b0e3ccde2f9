use bgproc_scheduler::{ConfigError, ConfigFile, ProcessRecord, SchedulerConfig, TerminalSink};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_FILE: &str = "scheduler.json";
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unable to resolve local data directory")]
    NoDataDirectory,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Data directory holding the scheduler configuration and process history
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u32,
    config: ConfigFile,
}

impl Storage {
    pub fn from_default_project() -> Result<Self, StorageError> {
        let dirs =
            ProjectDirs::from("dev", "bgproc", "bgproc").ok_or(StorageError::NoDataDirectory)?;

        Ok(Self { root: dirs.data_local_dir().to_path_buf() })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stored configuration, or the defaults when none was saved yet
    pub fn load_config(&self) -> Result<SchedulerConfig, StorageError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(SchedulerConfig::default());
        }

        let bytes = fs::read(path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version > CONFIG_SCHEMA_VERSION {
            warn!(version = envelope.version, "config written by a newer version");
        }

        let config = SchedulerConfig::from(envelope.config);
        config.validate()?;
        Ok(config)
    }

    pub fn save_config(&self, config: &SchedulerConfig) -> Result<(), StorageError> {
        config.validate()?;
        fs::create_dir_all(&self.root)?;

        let envelope =
            ConfigEnvelope { version: CONFIG_SCHEMA_VERSION, config: ConfigFile::from(config) };

        let bytes = serde_json::to_vec_pretty(&envelope)?;
        fs::write(self.config_path(), bytes)?;
        Ok(())
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    /// Open the history log in this directory
    pub fn history_store(&self) -> Result<HistoryStore, StorageError> {
        HistoryStore::open(self.history_path())
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }
}

/// Append-only JSON-lines log of terminal process records
///
/// Attach it with `ProcessScheduler::with_sink`; every record that reaches a
/// terminal state becomes one line.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl HistoryStore {
    /// Open (or create) the log at `path`, creating parent directories
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "history log opened");

        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ProcessRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<ProcessRecord>, StorageError> {
        read_history(&self.path)
    }
}

impl TerminalSink for HistoryStore {
    fn record_terminal(&self, record: &ProcessRecord) {
        if let Err(error) = self.append(record) {
            warn!(process_id = %record.process_id, %error, "failed to append history");
        }
    }
}

/// Read every record from a history log, oldest first. Blank lines are skipped.
pub fn read_history(path: impl AsRef<Path>) -> Result<Vec<ProcessRecord>, StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
