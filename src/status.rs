use std::error::Error;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DbCredentials;
use crate::filesystem::Cursor;
use crate::schedule::Schedule;

pub const STATUS_PATH: &str = "/var/lib/bitcalm/data";

/// Object store access handed out by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Access {
    pub key_id: String,
    pub secret_key: String,
    pub bucket: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    Filesystem,
    Database,
    Complete,
}

/// Residual work queue of the filesystem phase. Directories are expanded
/// lazily; both lists shrink as entries are processed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupItems {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Checkpoint of the in-flight backup. Present in the status record exactly
/// while a backup is running; a restart resumes from `phase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupState {
    pub backup_id: i64,
    pub schedule_id: i64,
    pub phase: Phase,
    pub is_full: bool,
    pub items: Option<BackupItems>,
    /// (host, port, name) triples still to dump.
    pub databases: Option<Vec<(String, u16, String)>>,
    pub size: u64,
    pub files_count: u64,
}

impl BackupState {
    pub fn new(backup_id: i64, schedule_id: i64) -> BackupState {
        BackupState {
            backup_id,
            schedule_id,
            phase: Phase::Prepare,
            is_full: false,
            items: None,
            databases: None,
            size: 0,
            files_count: 0,
        }
    }
}

/// Everything the agent remembers between runs. Loaded once at startup,
/// saved on every observable mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub key: String,
    pub is_registered: bool,
    pub fshash: Option<String>,
    pub schedules: Vec<Schedule>,
    pub database: Vec<DbCredentials>,
    pub backup: Option<BackupState>,
    pub amazon: Option<S3Access>,
    pub last_ver_check: Option<DateTime<Utc>>,
    /// Pending directories of the level walk, None when no walk is underway.
    pub upload_dirs: Option<Cursor>,
    pub last_fs_upload: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub path: String,
}

impl Status {
    /// Reads the record, falling back to the `.bak` sibling when the primary
    /// copy does not parse. A missing file yields a fresh record. A fresh
    /// install key is generated and persisted when absent.
    pub fn load(path: &str) -> Result<Status, Box<dyn Error>> {
        let bak = bak_path(path);
        let mut status = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Status>(&bytes) {
                Ok(status) => {
                    // Good primary: refresh the fallback copy.
                    if let Err(e) = fs::write(&bak, &bytes) {
                        warn!("could not refresh {}: {}", bak, e);
                    }
                    status
                }
                Err(e) => {
                    warn!("status file {} is corrupt ({}), trying {}", path, e, bak);
                    serde_json::from_slice::<Status>(&fs::read(&bak)?)?
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Status::default(),
            Err(e) => return Err(Box::new(e)),
        };
        status.path = path.to_string();
        if status.key.is_empty() {
            status.key = Uuid::new_v4().to_string();
            status.save()?;
        }
        Ok(status)
    }

    /// Writes the whole record, whole-file then rename so readers never see
    /// a torn write.
    pub fn save(&self) -> io::Result<()> {
        if let Some(dir) = Path::new(&self.path).parent() {
            fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let tmp = format!("{}.tmp", self.path);
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)
    }

    pub fn get_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for s in &self.schedules {
            files.extend(s.files.iter().cloned());
        }
        files.sort();
        files.dedup();
        files
    }

    pub fn has_files(&self) -> bool {
        self.schedules.iter().any(|s| !s.files.is_empty())
    }
}

pub fn bak_path(path: &str) -> String {
    format!("{}.bak", path)
}
