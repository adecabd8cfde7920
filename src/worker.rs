use std::cmp::max;
use std::error::Error;
use std::fs::{self, File};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Duration, Utc};
use log::{error, info, warn};
use serde_json::Value;

use crate::actions::{self, Action, ActionPool, Follower, Outcome, PoolCtx};
use crate::api::Api;
use crate::backup::{ApiControl, Pipeline, PipelineOutcome, RestoreTask};
use crate::catalog::{Catalog, CATALOG_PATH};
use crate::cmd_execute::{Cmd, Executor};
use crate::config::{Config, DbCredentials};
use crate::database;
use crate::filesystem::{self, ChangeLog, LevelWalk};
use crate::log_buffer::{self, UploadBuffer};
use crate::s3_utils::S3Store;
use crate::schedule::{self, Schedule};
use crate::status::{S3Access, Status, STATUS_PATH};

pub const FS_UPLOAD_PERIOD: i64 = 1800;
pub const LOG_UPLOAD_PERIOD: i64 = 300;
pub const CHANGES_PERIOD: i64 = 600;
pub const DB_CHECK_PERIOD: i64 = 3600;
pub const S3_ACCESS_PERIOD: i64 = 600;
pub const VERSION_CHECK_PERIOD: i64 = 3600;
pub const ONE_SHOT_RETRY_PERIOD: i64 = 600;

const FS_SLICE_BUDGET_SECS: i64 = 120;
const CRASH_REPORT_BYTES: u64 = 1024;
const IDLE_SLEEP: std::time::Duration = std::time::Duration::from_secs(60);

pub const CRASH_PATH: &str = "/var/log/bitcalm.crash";

pub mod tags {
    pub const UPLOAD_LOG: &str = "upload_log";
    pub const UPLOAD_FS: &str = "upload_fs";
    pub const CHECK_CHANGES: &str = "check_changes";
    pub const CHECK_DB: &str = "check_db";
    pub const CHECK_VERSION: &str = "check_version";
    pub const GET_S3_ACCESS: &str = "get_s3_access";
    pub const MAKE_BACKUP: &str = "make_backup";
    pub const RESTORE: &str = "restore";
    pub const UPDATE: &str = "update";
    pub const CHECK_FREE_SPACE: &str = "check_free_space";
}

/// The worker: owns all agent state and runs the cooperative action loop on
/// a single thread. Long actions keep their own step budgets instead of
/// being preempted.
pub struct Worker {
    pub config: Config,
    pub status: Status,
    pub catalog: Catalog,
    pub api: Api,
    pub s3: Option<S3Store>,
    pub rt: tokio::runtime::Runtime,
    pub pool: ActionPool<Worker>,
    pub changelog: Arc<Mutex<ChangeLog>>,
    pub log_upload: UploadBuffer,
    pub tmp_dir: String,
}

impl PoolCtx for Worker {
    fn pool(&mut self) -> &mut ActionPool<Worker> {
        &mut self.pool
    }
}

impl Worker {
    pub fn new(config: Config, log_upload: UploadBuffer) -> Result<Worker, Box<dyn Error>> {
        let status = Status::load(STATUS_PATH)?;
        let api = Api::new(&config, &status.key);
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(max(2, num_cpus::get()))
            .enable_all()
            .build()?;
        let s3 = match &status.amazon {
            Some(access) => Some(S3Store::new(access)?),
            None => None,
        };
        Ok(Worker {
            config,
            status,
            catalog: Catalog::open(CATALOG_PATH),
            api,
            s3,
            rt,
            pool: ActionPool::new(),
            changelog: Arc::new(Mutex::new(ChangeLog::new())),
            log_upload,
            tmp_dir: "/tmp".to_string(),
        })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn Error>> {
        self.register()?;
        self.report_crash();
        self.fetch_schedules();
        self.fetch_db_credentials();
        self.install_actions();
        info!("start main loop");
        loop {
            let next = self.pool.next().map(|a| (a.tag.clone(), a.time_left()));
            match next {
                Some((tag, left)) => {
                    info!("next action is {} in {}s", tag, left.as_secs());
                    thread::sleep(left);
                    actions::run_due(self);
                }
                None => thread::sleep(IDLE_SLEEP),
            }
        }
    }

    fn register(&mut self) -> Result<(), Box<dyn Error>> {
        if self.status.is_registered {
            return Ok(());
        }
        info!("sending info about new client");
        let uts = nix::sys::utsname::uname();
        let uname = format!(
            "{} {} {} {} {}",
            uts.sysname(),
            uts.nodename(),
            uts.release(),
            uts.version(),
            uts.machine()
        );
        let (code, _) = self
            .rt
            .block_on(self.api.hi(uts.nodename(), &uname, crate::VERSION))?;
        if code != 200 {
            return Err(format!("registration refused with status {}", code).into());
        }
        self.status.is_registered = true;
        self.status.save()?;
        Ok(())
    }

    /// Ships the tail of the crash file left by a previous run, then
    /// truncates it.
    fn report_crash(&mut self) {
        let meta = match fs::metadata(CRASH_PATH) {
            Ok(m) if m.len() > 0 => m,
            _ => return,
        };
        let info = match log_buffer::tail(CRASH_PATH, CRASH_REPORT_BYTES) {
            Ok(i) => i,
            Err(_) => return,
        };
        let when = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(|| Utc::now().timestamp());
        match self.rt.block_on(self.api.report_crash(info.as_bytes(), when)) {
            Ok(200) => {
                info!("crash reported");
                let _ = File::create(CRASH_PATH);
            }
            _ => warn!("crash report failed"),
        }
    }

    /// Seeds the schedule list at startup. 404 just means nothing is
    /// configured yet; the periodic change pull picks schedules up later.
    fn fetch_schedules(&mut self) {
        if !self.status.schedules.is_empty() {
            return;
        }
        match self.rt.block_on(self.api.get_schedules()) {
            Ok((200, Value::Array(payloads))) => apply_schedules(self, &payloads),
            Ok((200, _)) | Ok((304, _)) | Ok((404, _)) => {}
            Ok((code, _)) => warn!("schedule pull returned {}", code),
            Err(e) => warn!("schedule pull failed: {}", e),
        }
    }

    fn fetch_db_credentials(&mut self) {
        if !self.config.database.is_empty() || !self.status.database.is_empty() {
            return;
        }
        match self.rt.block_on(self.api.get_db_credentials()) {
            Ok((200, db)) if !db.is_null() => apply_db(self, &db),
            Ok(_) => {}
            Err(e) => warn!("credential pull failed: {}", e),
        }
    }

    fn install_actions(&mut self) {
        let mut installed = vec![
            Action::periodic(tags::UPLOAD_LOG, LOG_UPLOAD_PERIOD, Box::new(upload_log)),
            Action::periodic(tags::CHECK_CHANGES, CHANGES_PERIOD, Box::new(check_changes)),
            Action::periodic(tags::UPLOAD_FS, FS_UPLOAD_PERIOD, Box::new(upload_fs)),
            Action::periodic(
                tags::CHECK_VERSION,
                VERSION_CHECK_PERIOD,
                Box::new(check_version),
            ),
        ];
        if !self.config.database.is_empty() || !self.status.database.is_empty() {
            installed.push(Action::periodic(
                tags::CHECK_DB,
                DB_CHECK_PERIOD,
                Box::new(check_db),
            ));
        }
        if self.status.amazon.is_some() {
            installed.push(backup_action());
        } else {
            let mut access = Action::periodic(
                tags::GET_S3_ACCESS,
                S3_ACCESS_PERIOD,
                Box::new(get_s3_access),
            )
            .one_time(vec![Follower::Seed(Box::new(backup_action))], Vec::new());
            access.delay(0);
            installed.push(access);
        }
        self.pool.extend(installed);
        arm_tag(self, tags::MAKE_BACKUP);
    }
}

/// Re-arms the tagged action against current context. The action is
/// detached first so the pool borrow stays clean.
pub fn arm_tag(w: &mut Worker, tag: &str) {
    if let Some(mut action) = w.pool.remove(tag) {
        action.arm(w);
        w.pool.add(action);
    }
}

fn backup_action() -> Action<Worker> {
    Action::with_provider(
        tags::MAKE_BACKUP,
        Box::new(|w: &Worker| {
            schedule::current(&w.status.schedules).and_then(|s| s.next_backup)
        }),
        Box::new(make_backup),
    )
}

fn upload_log(w: &mut Worker) -> Outcome {
    let entries: Vec<String> = w.log_upload.lock().unwrap().clone();
    if entries.is_empty() {
        return Outcome::Done;
    }
    match w.rt.block_on(w.api.upload_log(&entries)) {
        Ok(200) => {
            let mut buffer = w.log_upload.lock().unwrap();
            let flushed = entries.len().min(buffer.len());
            buffer.drain(..flushed);
            Outcome::Done
        }
        _ => Outcome::Failed,
    }
}

fn get_s3_access(w: &mut Worker) -> Outcome {
    let (code, value) = match w.rt.block_on(w.api.get_s3_access()) {
        Ok(r) => r,
        Err(e) => {
            error!("getting s3 access failed: {}", e);
            return Outcome::Failed;
        }
    };
    if code != 200 {
        return Outcome::Failed;
    }
    match serde_json::from_value::<S3Access>(value) {
        Ok(access) => apply_access(w, access).into(),
        Err(e) => {
            error!("unusable s3 access payload: {}", e);
            Outcome::Failed
        }
    }
}

fn apply_access(w: &mut Worker, access: S3Access) -> bool {
    match S3Store::new(&access) {
        Ok(store) => {
            w.s3 = Some(store);
            w.status.amazon = Some(access);
            if let Err(e) = w.status.save() {
                error!("could not persist s3 access: {}", e);
                return false;
            }
            true
        }
        Err(e) => {
            error!("could not build s3 client: {}", e);
            false
        }
    }
}

fn make_backup(w: &mut Worker) -> Outcome {
    if w.s3.is_none() {
        if let Some(access) = w.status.amazon.clone() {
            w.s3 = S3Store::new(&access).ok();
        }
    }
    let (s3, user) = match (&w.s3, &w.status.amazon) {
        (Some(s3), Some(access)) => (s3, access.user.clone()),
        _ => return Outcome::Failed,
    };
    let control = ApiControl {
        api: &w.api,
        rt: &w.rt,
    };
    let outcome = {
        let mut pipeline = Pipeline {
            user,
            config: &w.config,
            status: &mut w.status,
            catalog: &w.catalog,
            s3,
            api: &control,
            rt: &w.rt,
            tmp_dir: w.tmp_dir.clone(),
        };
        pipeline.run()
    };
    match outcome {
        PipelineOutcome::Complete => Outcome::Done,
        PipelineOutcome::Failed => Outcome::Failed,
        PipelineOutcome::NoSpace { required } => {
            handle_no_space(w, required);
            Outcome::Failed
        }
    }
}

/// Trips the schedule breaker and arms a probe that re-enables it once
/// enough space is back.
fn handle_no_space(w: &mut Worker, required: u64) {
    let schedule_id = w.status.backup.as_ref().map(|b| b.schedule_id);
    for s in w.status.schedules.iter_mut() {
        if schedule_id.map(|id| s.id == id).unwrap_or(true) {
            s.exclude = true;
        }
    }
    if let Err(e) = w.status.save() {
        error!("could not persist excluded schedule: {}", e);
    }
    if !w.pool.contains(tags::CHECK_FREE_SPACE) {
        let probe = move |w: &mut Worker| -> Outcome { check_free_space(w, required).into() };
        let action = Action::periodic(tags::CHECK_FREE_SPACE, ONE_SHOT_RETRY_PERIOD, Box::new(probe))
            .one_time(Vec::new(), Vec::new());
        w.pool.add(action);
    }
}

fn check_free_space(w: &mut Worker, required: u64) -> bool {
    match filesystem::free_space(&w.tmp_dir) {
        Ok(free) if free >= required => {
            info!("free space is back ({} bytes)", free);
            for s in w.status.schedules.iter_mut() {
                s.exclude = false;
            }
            if let Err(e) = w.status.save() {
                error!("could not persist schedules: {}", e);
            }
            arm_tag(w, tags::MAKE_BACKUP);
            true
        }
        Ok(_) => false,
        Err(e) => {
            error!("space probe failed: {}", e);
            false
        }
    }
}

fn check_changes(w: &mut Worker) -> Outcome {
    let (code, changes) = match w.rt.block_on(w.api.get_changes()) {
        Ok(r) => r,
        Err(e) => {
            error!("pulling changes failed: {}", e);
            return Outcome::Failed;
        }
    };
    match code {
        200 => {}
        304 => return Outcome::Done,
        _ => return Outcome::Failed,
    }
    let changes = match changes.as_object() {
        Some(o) => o.clone(),
        None => return Outcome::Done,
    };

    if changes.get("uninstall").and_then(Value::as_bool) == Some(true) {
        uninstall(w);
    }
    if let Some(version) = changes.get("version") {
        apply_version(w, version);
    }
    if let Some(access) = changes.get("access") {
        if let Ok(access) = serde_json::from_value::<S3Access>(access.clone()) {
            if apply_access(w, access) {
                w.pool.remove(tags::GET_S3_ACCESS);
                w.pool.add(backup_action());
                arm_tag(w, tags::MAKE_BACKUP);
            }
        }
    }
    if let Some(db) = changes.get("db") {
        apply_db(w, db);
    }
    if let Some(schedules) = changes.get("schedules").and_then(Value::as_array) {
        apply_schedules(w, schedules);
    }
    match changes.get("restore") {
        Some(Value::Array(tasks)) => apply_restore(w, tasks),
        Some(Value::Bool(true)) => fetch_restore_tasks(w),
        _ => {}
    }
    if changes.get("log_tail").and_then(Value::as_bool) == Some(true) {
        if let Ok(tail) = log_buffer::tail(log_buffer::LOG_PATH, CRASH_REPORT_BYTES) {
            w.log_upload.lock().unwrap().push(tail);
        }
        if let Some(a) = w.pool.get_mut(tags::UPLOAD_LOG) {
            a.delay(0);
        }
    }
    if changes.get("send_fs").and_then(Value::as_bool) == Some(true) {
        w.status.upload_dirs = None;
        w.status.fshash = None;
        if let Err(e) = w.status.save() {
            error!("could not reset filesystem cursor: {}", e);
        }
        if let Some(a) = w.pool.get_mut(tags::UPLOAD_FS) {
            a.delay(0);
        }
    }
    Outcome::Done
}

fn uninstall(w: &mut Worker) {
    info!("uninstall requested, removing agent state");
    let _ = fs::remove_file(STATUS_PATH);
    let _ = fs::remove_file(crate::status::bak_path(STATUS_PATH));
    let _ = fs::remove_file(w.catalog.path());
    std::process::exit(0);
}

fn apply_version(w: &mut Worker, version: &Value) {
    let ver = version
        .get("ver")
        .or_else(|| version.get("version"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let url = match version.get("url").and_then(Value::as_str) {
        Some(u) => u.to_string(),
        None => return,
    };
    if ver == crate::VERSION {
        return;
    }
    install_update_action(w, url);
}

fn install_update_action(w: &mut Worker, url: String) {
    if w.pool.contains(tags::UPDATE) {
        return;
    }
    let func = move |w: &mut Worker| -> Outcome { do_update(w, &url).into() };
    let mut action = Action::periodic(tags::UPDATE, ONE_SHOT_RETRY_PERIOD, Box::new(func))
        .one_time(Vec::new(), Vec::new());
    action.delay(0);
    w.pool.add(action);
}

fn do_update(w: &mut Worker, url: &str) -> bool {
    info!("fetching update from {}", url);
    let bytes = match w.rt.block_on(w.api.download(url)) {
        Ok(b) => b,
        Err(e) => {
            error!("update download failed: {}", e);
            return false;
        }
    };
    let staged = format!("{}/bitcalm-update", w.tmp_dir);
    if fs::write(&staged, &bytes).is_err() {
        return false;
    }
    match Cmd::new("sh").arg(&staged).execute() {
        Ok(_) => {
            info!("update installed, restarting");
            std::process::exit(0);
        }
        Err(e) => {
            error!("update install failed: {}", e);
            false
        }
    }
}

fn apply_db(w: &mut Worker, db: &Value) {
    match serde_json::from_value::<Vec<DbCredentials>>(db.clone()) {
        Ok(database) => {
            w.status.database = database;
            if let Err(e) = w.status.save() {
                error!("could not persist database credentials: {}", e);
                return;
            }
            if !w.status.database.is_empty() && !w.pool.contains(tags::CHECK_DB) {
                w.pool.add(Action::periodic(
                    tags::CHECK_DB,
                    DB_CHECK_PERIOD,
                    Box::new(check_db),
                ));
            }
        }
        Err(e) => error!("unusable database payload: {}", e),
    }
}

fn apply_schedules(w: &mut Worker, payloads: &[Value]) {
    let mut fresh: Vec<Schedule> = payloads.iter().filter_map(Schedule::from_payload).collect();
    for s in fresh.iter_mut() {
        if let Some(old) = w.status.schedules.iter().find(|o| o.id == s.id) {
            s.inherit(old);
        }
    }
    info!("{} schedules installed", fresh.len());
    w.status.schedules = fresh;
    if let Err(e) = w.status.save() {
        error!("could not persist schedules: {}", e);
        return;
    }
    if w.status.amazon.is_some() {
        w.pool.add(backup_action());
    }
    arm_tag(w, tags::MAKE_BACKUP);
}

/// The change feed only flagged that restore tasks exist; fetch them.
fn fetch_restore_tasks(w: &mut Worker) {
    match w.rt.block_on(w.api.check_restore()) {
        Ok((200, Value::Array(tasks))) => apply_restore(w, &tasks),
        Ok((200, _)) | Ok((304, _)) => {}
        Ok((code, _)) => warn!("restore pull returned {}", code),
        Err(e) => error!("restore pull failed: {}", e),
    }
}

fn apply_restore(w: &mut Worker, payload: &[Value]) {
    let tasks: Vec<RestoreTask> = payload
        .iter()
        .filter_map(|item| {
            Some(RestoreTask {
                id: item.get("id")?.as_i64()?,
                backup_id: item.get("backup_id")?.as_i64()?,
            })
        })
        .collect();
    if tasks.is_empty() {
        return;
    }
    info!("{} restore tasks queued", tasks.len());
    let func = move |w: &mut Worker| -> Outcome { do_restore(w, &tasks).into() };
    let mut action = Action::periodic(tags::RESTORE, ONE_SHOT_RETRY_PERIOD, Box::new(func))
        .one_time(Vec::new(), Vec::new());
    action.delay(0);
    w.pool.add(action);
}

fn do_restore(w: &mut Worker, tasks: &[RestoreTask]) -> bool {
    let (s3, user) = match (&w.s3, &w.status.amazon) {
        (Some(s3), Some(access)) => (s3, access.user.clone()),
        _ => return false,
    };
    let control = ApiControl {
        api: &w.api,
        rt: &w.rt,
    };
    let mut pipeline = Pipeline {
        user,
        config: &w.config,
        status: &mut w.status,
        catalog: &w.catalog,
        s3,
        api: &control,
        rt: &w.rt,
        tmp_dir: w.tmp_dir.clone(),
    };
    pipeline.restore(tasks)
}

/// Ships the filesystem image one breadth-first level at a time, resuming
/// from the persisted cursor and giving control back when the slice budget
/// runs out.
fn upload_fs(w: &mut Worker) -> Outcome {
    let (changed, rescan) = w.changelog.lock().unwrap().drain();
    if rescan {
        w.status.upload_dirs = None;
    }
    let mut action = "append";
    let mut walk = match w.status.upload_dirs.take() {
        Some(cursor) => LevelWalk::resume(cursor),
        None if changed.is_empty() || rescan => {
            action = "start";
            LevelWalk::start()
        }
        None => LevelWalk::resume(Vec::new()),
    };
    for path in &changed {
        walk.inject(path);
    }

    let deadline = Utc::now() + Duration::seconds(FS_SLICE_BUDGET_SECS);
    loop {
        let (level, has_next) = match walk.next_level() {
            Some(l) => l,
            None => break,
        };
        match w.rt.block_on(w.api.update_fs(&level, action, has_next)) {
            Ok(200) => {}
            _ => {
                w.status.upload_dirs = Some(walk.into_cursor());
                let _ = w.status.save();
                return Outcome::Failed;
            }
        }
        action = "append";
        if !has_next {
            break;
        }
        if Utc::now() >= deadline {
            w.status.upload_dirs = Some(walk.into_cursor());
            let _ = w.status.save();
            return Outcome::Again;
        }
    }
    w.status.upload_dirs = None;
    w.status.last_fs_upload = Some(Utc::now());
    match w.status.save() {
        Ok(()) => Outcome::Done,
        Err(e) => {
            error!("could not persist filesystem cursor: {}", e);
            Outcome::Failed
        }
    }
}

/// Reports database names on every reachable MySQL host. A host that does
/// not answer is logged and skipped so the others still get through.
fn check_db(w: &mut Worker) -> Outcome {
    let creds: Vec<DbCredentials> = w
        .config
        .database
        .iter()
        .chain(w.status.database.iter())
        .cloned()
        .collect();
    if creds.is_empty() {
        return Outcome::Done;
    }
    let mut found = serde_json::Map::new();
    for c in &creds {
        let host_port = format!("{}:{}", c.host, c.port);
        if found.contains_key(&host_port) {
            continue;
        }
        match database::get_databases(&c.host, c.port, &c.user, &c.passwd) {
            Some(names) => {
                found.insert(host_port, Value::from(names));
            }
            None => error!("could not list databases on {}", host_port),
        }
    }
    if found.is_empty() {
        return Outcome::Failed;
    }
    match w.rt.block_on(w.api.set_databases(&Value::Object(found))) {
        Ok(200) => Outcome::Done,
        _ => Outcome::Failed,
    }
}

/// Once a day, tells the controller which version runs here and picks up an
/// update instruction if one comes back.
fn check_version(w: &mut Worker) -> Outcome {
    if let Some(last) = w.status.last_ver_check {
        if Utc::now() - last < Duration::days(1) {
            return Outcome::Done;
        }
    }
    let (code, body) = match w.rt.block_on(w.api.check_version(crate::VERSION)) {
        Ok(r) => r,
        Err(e) => {
            error!("version check failed: {}", e);
            return Outcome::Failed;
        }
    };
    if code != 200 && code != 304 {
        return Outcome::Failed;
    }
    w.status.last_ver_check = Some(Utc::now());
    if let Err(e) = w.status.save() {
        error!("could not persist version check: {}", e);
    }
    // a truthy body means a newer build is published
    if code == 200 && body.trim() == "1" {
        match w.rt.block_on(w.api.get_version()) {
            Ok((200, current)) => apply_version(w, &current),
            Ok((code, _)) => warn!("current version pull returned {}", code),
            Err(e) => error!("current version pull failed: {}", e),
        }
    }
    Outcome::Done
}
