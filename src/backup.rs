use std::error::Error;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use chrono::Utc;
use flate2::read::{GzDecoder, GzEncoder as ReadGzEncoder};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info, warn};
use regex::Regex;
use serde_json::Value;

use crate::api::Api;
use crate::catalog::{Catalog, CatalogEntry};
use crate::config::Config;
use crate::database;
use crate::filesystem;
use crate::s3_utils::{self, S3Store, PART_SIZE};
use crate::schedule;
use crate::status::{BackupItems, Phase, Status};

/// Dump staging needs at least this much room before a database phase is
/// attempted.
pub const DUMP_SPACE_MIN: u64 = 64 * 1024 * 1024;
const STATS_FLUSH_EVERY: u64 = 100;

pub enum PipelineOutcome {
    Complete,
    Failed,
    NoSpace { required: u64 },
}

enum PhaseError {
    Transient(Box<dyn Error>),
    NoSpace(u64),
}

impl From<io::Error> for PhaseError {
    fn from(e: io::Error) -> PhaseError {
        PhaseError::Transient(Box::new(e))
    }
}

impl From<rusqlite::Error> for PhaseError {
    fn from(e: rusqlite::Error) -> PhaseError {
        PhaseError::Transient(Box::new(e))
    }
}

impl From<Box<dyn Error>> for PhaseError {
    fn from(e: Box<dyn Error>) -> PhaseError {
        PhaseError::Transient(e)
    }
}

pub struct FsReply {
    pub is_full: bool,
    pub prev: Option<i64>,
}

/// The controller calls the backup pipeline depends on, separated out so the
/// pipeline can be driven against a scripted controller in tests.
pub trait ControlApi {
    fn backup_prepare(&self, time: i64, schedule_id: i64) -> Result<i64, Box<dyn Error>>;
    fn backup_filesystem(&self, backup_id: i64, has_info: bool) -> Result<FsReply, Box<dyn Error>>;
    fn backup_database(&self, backup_id: i64) -> Result<(), Box<dyn Error>>;
    fn backup_complete(&self, backup_id: i64, time: i64, size: u64) -> Result<(), Box<dyn Error>>;
    fn flush_stats(&self, backup_id: i64, files_count: u64, size: u64)
        -> Result<(), Box<dyn Error>>;
    fn files_info(&self, backup_id: i64) -> Result<Vec<CatalogEntry>, Box<dyn Error>>;
    fn restore_done(&self, tasks: &[i64]) -> Result<(), Box<dyn Error>>;
}

/// Production `ControlApi` backed by the HTTP client.
pub struct ApiControl<'a> {
    pub api: &'a Api,
    pub rt: &'a tokio::runtime::Runtime,
}

impl ControlApi for ApiControl<'_> {
    fn backup_prepare(&self, time: i64, schedule_id: i64) -> Result<i64, Box<dyn Error>> {
        self.rt
            .block_on(self.api.backup_prepare(time, schedule_id))?
            .ok_or_else(|| "backup prepare was not accepted".into())
    }

    fn backup_filesystem(&self, backup_id: i64, has_info: bool) -> Result<FsReply, Box<dyn Error>> {
        let reply = self
            .rt
            .block_on(self.api.backup_filesystem(backup_id, has_info))?
            .ok_or("backup filesystem was not accepted")?;
        Ok(FsReply {
            is_full: reply.get("is_full").and_then(Value::as_bool).unwrap_or(false),
            prev: reply.get("prev").and_then(Value::as_i64),
        })
    }

    fn backup_database(&self, backup_id: i64) -> Result<(), Box<dyn Error>> {
        match self.rt.block_on(self.api.backup_database(backup_id))? {
            200 => Ok(()),
            status => Err(format!("backup database returned {}", status).into()),
        }
    }

    fn backup_complete(&self, backup_id: i64, time: i64, size: u64) -> Result<(), Box<dyn Error>> {
        match self
            .rt
            .block_on(self.api.backup_complete(backup_id, time, size))?
        {
            200 => Ok(()),
            status => Err(format!("backup complete returned {}", status).into()),
        }
    }

    fn flush_stats(
        &self,
        backup_id: i64,
        files_count: u64,
        size: u64,
    ) -> Result<(), Box<dyn Error>> {
        match self
            .rt
            .block_on(self.api.upload_files_info(backup_id, files_count, size))?
        {
            200 => Ok(()),
            status => Err(format!("stats upload returned {}", status).into()),
        }
    }

    fn files_info(&self, backup_id: i64) -> Result<Vec<CatalogEntry>, Box<dyn Error>> {
        let (status, value) = self.rt.block_on(self.api.get_files_info(backup_id))?;
        if status != 200 {
            return Err(format!("files info returned {}", status).into());
        }
        let list = value.as_array().ok_or("files info is not a list")?;
        Ok(list
            .iter()
            .filter_map(|item| {
                Some(CatalogEntry {
                    path: item.get("path")?.as_str()?.to_string(),
                    hash_key: item.get("hash_key").and_then(Value::as_i64).unwrap_or(1) != 0,
                    mtime: item.get("mtime").and_then(Value::as_f64).unwrap_or(0.0),
                    size: item.get("size").and_then(Value::as_i64).unwrap_or(0),
                    mode: item.get("mode").and_then(Value::as_u64).unwrap_or(0) as u32,
                    uid: item.get("uid").and_then(Value::as_u64).unwrap_or(0) as u32,
                    gid: item.get("gid").and_then(Value::as_u64).unwrap_or(0) as u32,
                    compress: item.get("compress").and_then(Value::as_i64).unwrap_or(1) != 0,
                    backup_id: item
                        .get("backup_id")
                        .and_then(Value::as_i64)
                        .unwrap_or(backup_id),
                })
            })
            .collect())
    }

    fn restore_done(&self, tasks: &[i64]) -> Result<(), Box<dyn Error>> {
        match self.rt.block_on(self.api.restore_complete(tasks))? {
            200 => Ok(()),
            status => Err(format!("restore complete returned {}", status).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoreTask {
    pub id: i64,
    pub backup_id: i64,
}

/// Resumable backup pipeline. All durable state lives in
/// `status.backup`; every phase transition and every processed item is
/// persisted before the next side effect, so a restart repeats at most the
/// side effect at the crash boundary.
pub struct Pipeline<'a> {
    pub user: String,
    pub config: &'a Config,
    pub status: &'a mut Status,
    pub catalog: &'a Catalog,
    pub s3: &'a S3Store,
    pub api: &'a dyn ControlApi,
    pub rt: &'a tokio::runtime::Runtime,
    pub tmp_dir: String,
}

impl<'a> Pipeline<'a> {
    pub fn run(&mut self) -> PipelineOutcome {
        if self.status.backup.is_none() {
            let (schedule_id, time) = match schedule::current(&self.status.schedules) {
                Some(s) => (s.id, Utc::now().timestamp()),
                None => return PipelineOutcome::Failed,
            };
            let backup_id = match self.api.backup_prepare(time, schedule_id) {
                Ok(id) => id,
                Err(e) => {
                    error!("backup prepare failed: {}", e);
                    return PipelineOutcome::Failed;
                }
            };
            info!("backup {} started for schedule {}", backup_id, schedule_id);
            self.status.backup = Some(crate::status::BackupState::new(backup_id, schedule_id));
            if let Err(e) = self.status.save() {
                error!("could not persist backup state: {}", e);
                return PipelineOutcome::Failed;
            }
        }

        loop {
            let phase = match &self.status.backup {
                Some(state) => state.phase,
                None => return PipelineOutcome::Complete,
            };
            let step = match phase {
                Phase::Prepare => self.enter_filesystem(),
                Phase::Filesystem => self.run_filesystem(),
                Phase::Database => self.run_databases(),
                Phase::Complete => self.finish(),
            };
            match step {
                Ok(()) => {
                    if self.status.backup.is_none() {
                        return PipelineOutcome::Complete;
                    }
                }
                Err(PhaseError::Transient(e)) => {
                    error!("backup phase {:?} failed: {}", phase, e);
                    return PipelineOutcome::Failed;
                }
                Err(PhaseError::NoSpace(required)) => {
                    error!(
                        "not enough free space in {} ({} bytes required)",
                        self.tmp_dir, required
                    );
                    return PipelineOutcome::NoSpace { required };
                }
            }
        }
    }

    fn state(&mut self) -> &mut crate::status::BackupState {
        self.status.backup.as_mut().unwrap()
    }

    fn catalog_basename(&self) -> String {
        self.catalog
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.db".to_string())
    }

    /// Phase 0 -> 1: negotiate full vs incremental, stage the work queue.
    fn enter_filesystem(&mut self) -> Result<(), PhaseError> {
        let backup_id = self.state().backup_id;
        let has_info = self.catalog.has_rows()?;
        let reply = self.api.backup_filesystem(backup_id, has_info)?;
        if reply.is_full {
            info!("backup {} is full, resetting catalog", backup_id);
            self.catalog.truncate()?;
        } else if let Some(prev) = reply.prev {
            self.absorb_remote_catalog(prev)?;
        }

        let schedule_id = self.state().schedule_id;
        let files: Vec<String> = match self
            .status
            .schedules
            .iter()
            .find(|s| s.id == schedule_id)
        {
            Some(s) => s.files.iter().cloned().collect(),
            None => {
                warn!("schedule {} disappeared, abandoning backup", schedule_id);
                self.status.backup = None;
                self.status.save()?;
                return Ok(());
            }
        };
        let mut items = BackupItems::default();
        for path in files {
            let p = Path::new(&path);
            if p.is_dir() {
                items.dirs.push(path);
            } else if p.is_file() {
                items.files.push(path);
            }
        }
        let state = self.state();
        state.is_full = reply.is_full;
        state.items = Some(items);
        state.phase = Phase::Filesystem;
        self.status.save()?;
        Ok(())
    }

    /// Pulls the manifest of a prior backup in as the incremental baseline.
    fn absorb_remote_catalog(&mut self, prev: i64) -> Result<(), PhaseError> {
        let key = s3_utils::catalog_key(&self.user, prev, &self.catalog_basename());
        let bytes = self
            .rt
            .block_on(self.s3.get(&key))
            .map_err(PhaseError::Transient)?;
        let tmp = format!("{}/bitcalm-baseline-{}.db", self.tmp_dir, prev);
        fs::write(&tmp, gunzip_bytes(&bytes)?)?;
        let baseline = Catalog::open(&tmp);
        let n = self.catalog.absorb(&baseline)?;
        info!("incremental baseline from backup {}: {} entries", prev, n);
        let _ = fs::remove_file(&tmp);
        Ok(())
    }

    /// Phase 1: drain the work queue, uploading one file at a time and
    /// persisting after each step.
    fn run_filesystem(&mut self) -> Result<(), PhaseError> {
        let compressed_re = filesystem::compressed_re();
        loop {
            let next_file = {
                let state = self.state();
                let items = state.items.get_or_insert_with(Default::default);
                if let Some(path) = items.files.pop() {
                    Some(path)
                } else if let Some(dir) = items.dirs.pop() {
                    let (dirs, files) = filesystem::expand_dir(&dir);
                    items.dirs.extend(dirs);
                    items.files.extend(files);
                    self.status.save()?;
                    continue;
                } else {
                    None
                }
            };
            match next_file {
                Some(path) => {
                    self.process_file(&path, &compressed_re)?;
                    self.status.save()?;
                }
                None => break,
            }
        }

        let schedule_id = self.state().schedule_id;
        let databases = self
            .status
            .schedules
            .iter()
            .find(|s| s.id == schedule_id)
            .map(|s| {
                s.databases
                    .iter()
                    .flat_map(|(host_port, names)| {
                        let (host, port) = split_host_port(host_port);
                        names
                            .iter()
                            .map(move |name| (host.clone(), port, name.clone()))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let state = self.state();
        state.databases = Some(databases);
        state.phase = Phase::Database;
        self.status.save()?;
        Ok(())
    }

    fn process_file(&mut self, path: &str, compressed_re: &Regex) -> Result<(), PhaseError> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => return Ok(()), // vanished or special file
        };
        let mtime = meta.mtime() as f64;
        let (backup_id, is_full) = {
            let state = self.state();
            (state.backup_id, state.is_full)
        };
        if !is_full && !self.catalog.is_modified(path, mtime)? {
            return Ok(());
        }

        let already_compressed = compressed_re.is_match(path);
        let key = s3_utils::file_key(&self.user, backup_id, path);
        let uploaded = if meta.len() <= PART_SIZE as u64 {
            let bytes = match fs::read(path) {
                Ok(b) => b,
                Err(_) => {
                    warn!("{} vanished before upload, skipped", path);
                    return Ok(());
                }
            };
            let body = if already_compressed {
                bytes
            } else {
                gzip_bytes(&bytes)?
            };
            self.rt.block_on(self.s3.put(&key, body))
        } else {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(_) => {
                    warn!("{} vanished before upload, skipped", path);
                    return Ok(());
                }
            };
            let reader: Box<dyn Read + Send> = if already_compressed {
                Box::new(file)
            } else {
                Box::new(ReadGzEncoder::new(file, Compression::default()))
            };
            self.rt.block_on(self.s3.put_stream(&key, reader))
        };
        let uploaded = uploaded.map_err(PhaseError::Transient)?;

        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => {
                warn!("{} vanished after upload, not cataloged", path);
                return Ok(());
            }
        };
        self.catalog.upsert(&CatalogEntry {
            path: path.to_string(),
            hash_key: true,
            mtime: meta.mtime() as f64,
            size: meta.len() as i64,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            compress: !already_compressed,
            backup_id,
        })?;

        let state = self.state();
        state.size += uploaded;
        state.files_count += 1;
        if state.files_count % STATS_FLUSH_EVERY == 0 {
            let (id, count, size) = (state.backup_id, state.files_count, state.size);
            if let Err(e) = self.api.flush_stats(id, count, size) {
                warn!("stats flush failed: {}", e);
            }
        }
        Ok(())
    }

    /// Phase 2: dump and upload the remaining databases one at a time.
    fn run_databases(&mut self) -> Result<(), PhaseError> {
        let backup_id = self.state().backup_id;
        if let Err(e) = self.api.backup_database(backup_id) {
            warn!("database phase report failed: {}", e);
        }
        loop {
            let next = self
                .state()
                .databases
                .as_ref()
                .and_then(|v| v.last().cloned());
            let (host, port, name) = match next {
                Some(t) => t,
                None => break,
            };

            let creds = match database::get_credentials(self.config, self.status, &host, port) {
                Some(c) => c.clone(),
                None => {
                    warn!("no credentials for {}:{}, skipping {}", host, port, name);
                    self.pop_database()?;
                    continue;
                }
            };

            let free = filesystem::free_space(&self.tmp_dir)?;
            if free < DUMP_SPACE_MIN {
                return Err(PhaseError::NoSpace(DUMP_SPACE_MIN));
            }

            let basename = format!(
                "{}_{}_{}_{}.sql.gz",
                host,
                port,
                name,
                Utc::now().format("%Y.%m.%d_%H%M")
            );
            let dump_path = format!("{}/{}", self.tmp_dir, basename);
            match database::dump(&host, port, &creds.user, &creds.passwd, &name, Path::new(&dump_path)) {
                Ok(()) => {}
                Err(e) => {
                    let _ = fs::remove_file(&dump_path);
                    if is_enospc(e.as_ref()) {
                        return Err(PhaseError::NoSpace(DUMP_SPACE_MIN.max(free * 2)));
                    }
                    warn!("dump of {} on {}:{} failed: {}", name, host, port, e);
                    self.pop_database()?;
                    continue;
                }
            }

            let key = s3_utils::db_key(&self.user, backup_id, &basename);
            let dump_size = fs::metadata(&dump_path)?.len();
            let uploaded = if dump_size <= PART_SIZE as u64 {
                let body = fs::read(&dump_path)?;
                self.rt.block_on(self.s3.put(&key, body))
            } else {
                let reader: Box<dyn Read + Send> = Box::new(File::open(&dump_path)?);
                self.rt.block_on(self.s3.put_stream(&key, reader))
            };
            let _ = fs::remove_file(&dump_path);
            let uploaded = uploaded.map_err(PhaseError::Transient)?;
            let state = self.state();
            state.size += uploaded;
            self.pop_database()?;
        }
        let state = self.state();
        state.phase = Phase::Complete;
        self.status.save()?;
        Ok(())
    }

    fn pop_database(&mut self) -> Result<(), PhaseError> {
        if let Some(v) = self.state().databases.as_mut() {
            v.pop();
        }
        self.status.save()?;
        Ok(())
    }

    /// Phase 3: publish the manifest, report completion, clear the
    /// checkpoint.
    fn finish(&mut self) -> Result<(), PhaseError> {
        let (backup_id, schedule_id, size) = {
            let state = self.state();
            (state.backup_id, state.schedule_id, state.size)
        };
        let bytes = fs::read(self.catalog.path())?;
        let key = s3_utils::catalog_key(&self.user, backup_id, &self.catalog_basename());
        self.rt
            .block_on(self.s3.put(&key, gzip_bytes(&bytes)?))
            .map_err(PhaseError::Transient)?;
        self.api
            .backup_complete(backup_id, Utc::now().timestamp(), size)?;
        if let Some(s) = self.status.schedules.iter_mut().find(|s| s.id == schedule_id) {
            s.done();
        }
        self.status.backup = None;
        self.status.save()?;
        info!("backup {} complete ({} bytes)", backup_id, size);
        Ok(())
    }

    /// Restores the given tasks in order. A failing task stops the loop;
    /// tasks finished before it are still reported.
    pub fn restore(&mut self, tasks: &[RestoreTask]) -> bool {
        let mut complete = Vec::new();
        let mut all_ok = true;
        for task in tasks {
            match self.restore_one(task) {
                Ok(()) => complete.push(task.id),
                Err(e) => {
                    error!("restore task {} failed: {}", task.id, e);
                    all_ok = false;
                    break;
                }
            }
        }
        if !complete.is_empty() {
            if let Err(e) = self.api.restore_done(&complete) {
                error!("reporting restored tasks failed: {}", e);
                return false;
            }
        }
        all_ok
    }

    fn restore_one(&mut self, task: &RestoreTask) -> Result<(), Box<dyn Error>> {
        info!("restoring backup {} (task {})", task.backup_id, task.id);
        let entries = self.manifest_for(task.backup_id)?;
        for entry in &entries {
            self.restore_file(entry)?;
        }
        self.restore_databases(task.backup_id)?;
        Ok(())
    }

    /// Manifest lookup order: local catalog, remote catalog, controller.
    fn manifest_for(&self, backup_id: i64) -> Result<Vec<CatalogEntry>, Box<dyn Error>> {
        if self.catalog.has_backup(backup_id)? {
            return Ok(self.catalog.entries_up_to(backup_id)?);
        }
        let key = s3_utils::catalog_key(&self.user, backup_id, &self.catalog_basename());
        match self.rt.block_on(self.s3.get(&key)) {
            Ok(bytes) => {
                let tmp = format!("{}/bitcalm-manifest-{}.db", self.tmp_dir, backup_id);
                fs::write(&tmp, gunzip_bytes(&bytes)?)?;
                let manifest = Catalog::open(&tmp);
                let entries = manifest.entries()?;
                let _ = fs::remove_file(&tmp);
                Ok(entries)
            }
            Err(e) => {
                warn!("no remote manifest for backup {} ({}), asking the server", backup_id, e);
                self.api.files_info(backup_id)
            }
        }
    }

    fn restore_file(&self, entry: &CatalogEntry) -> Result<(), Box<dyn Error>> {
        let key = if entry.hash_key {
            s3_utils::file_key(&self.user, entry.backup_id, &entry.path)
        } else {
            s3_utils::legacy_key(&self.user, &entry.path)
        };
        let parent = Path::new(&entry.path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        fs::create_dir_all(&parent)?;
        let existing = fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        let available = filesystem::free_space(&parent)? + existing;
        if available < entry.size as u64 {
            return Err(format!(
                "not enough space to restore {}: {} bytes needed, {} available",
                entry.path, entry.size, available
            )
            .into());
        }
        let bytes = self.rt.block_on(self.s3.get(&key))?;
        let data = if entry.compress {
            gunzip_bytes(&bytes)?
        } else {
            bytes
        };
        fs::write(&entry.path, &data)?;
        if entry.mode != 0 {
            let _ = fs::set_permissions(&entry.path, fs::Permissions::from_mode(entry.mode));
        }
        if entry.uid != 0 || entry.gid != 0 {
            let _ = nix::unistd::chown(
                Path::new(&entry.path),
                Some(nix::unistd::Uid::from_raw(entry.uid)),
                Some(nix::unistd::Gid::from_raw(entry.gid)),
            );
        }
        Ok(())
    }

    fn restore_databases(&self, backup_id: i64) -> Result<(), Box<dyn Error>> {
        let prefix = s3_utils::db_prefix(&self.user, backup_id);
        let keys = self.rt.block_on(self.s3.list(&prefix))?;
        for key in keys {
            let basename = key.rsplit('/').next().unwrap_or("");
            let (host, port, name) = match database::parse_dump_name(basename) {
                Some(t) => t,
                None => {
                    warn!("unrecognized dump object {}, skipped", key);
                    continue;
                }
            };
            let creds = match database::get_credentials(self.config, self.status, &host, port) {
                Some(c) => c.clone(),
                None => {
                    warn!("no credentials for {}:{}, skipping {}", host, port, name);
                    continue;
                }
            };
            let bytes = self.rt.block_on(self.s3.get(&key))?;
            let tmp = format!("{}/{}", self.tmp_dir, basename);
            fs::write(&tmp, &bytes)?;
            let result = database::import(Path::new(&tmp), &host, port, &creds.user, &creds.passwd, &name);
            let _ = fs::remove_file(&tmp);
            result?;
        }
        Ok(())
    }
}

pub fn split_host_port(host_port: &str) -> (String, u16) {
    match host_port.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(crate::config::DEFAULT_DB_PORT),
        ),
        None => (host_port.to_string(), crate::config::DEFAULT_DB_PORT),
    }
}

pub fn gzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn is_enospc(e: &(dyn Error + 'static)) -> bool {
    let mut source = Some(e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32) {
                return true;
            }
        }
        source = err.source();
    }
    false
}
