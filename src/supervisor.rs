use std::time::{Duration, Instant};
use std::{error::Error, thread};

use log::{error, info, warn};
use serde_json::Value;

use crate::api::Api;
use crate::cmd_execute::{Cmd, Executor};
use crate::config::Config;
use crate::log_buffer::{self, LOG_PATH};
use crate::status::{Status, STATUS_PATH};

/// A worker run shorter than this counts as a crash regardless of how it
/// ended.
pub const CRASH_THRESHOLD: Duration = Duration::from_secs(60);
/// Consecutive crashes before restarts slow down.
pub const SLOWDOWN_AFTER: u32 = 3;
/// Consecutive crashes before the emergency worker takes over.
pub const EMERGENCY_AFTER: u32 = 10;
pub const RESTART_PAUSE: Duration = Duration::from_secs(60);

pub const EMERGENCY_POLL: Duration = Duration::from_secs(300);
pub const EMERGENCY_WINDOW: Duration = Duration::from_secs(3600);

const EMERGENCY_LOG_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The worker will simply be restarted.
    Restarted,
    /// The crash streak tripped the fallback; the emergency worker ran.
    Emergency,
}

/// Restart policy around the worker. The only escalation signal is how long
/// a run lasted: short runs count as crashes whether they returned or blew
/// up, and a long run resets the streak.
pub struct Supervisor<W, E> {
    worker: W,
    emergency: E,
    crashes: u32,
    crash_threshold: Duration,
    restart_pause: Duration,
}

impl<W, E> Supervisor<W, E>
where
    W: FnMut() -> Result<(), String>,
    E: FnMut() -> bool,
{
    pub fn new(worker: W, emergency: E) -> Supervisor<W, E> {
        Supervisor {
            worker,
            emergency,
            crashes: 0,
            crash_threshold: CRASH_THRESHOLD,
            restart_pause: RESTART_PAUSE,
        }
    }

    pub fn with_timing(mut self, crash_threshold: Duration, restart_pause: Duration) -> Self {
        self.crash_threshold = crash_threshold;
        self.restart_pause = restart_pause;
        self
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    /// One worker attempt and its aftermath.
    pub fn step(&mut self) -> Step {
        let started = Instant::now();
        if let Err(e) = (self.worker)() {
            error!("worker died: {}", e);
        } else {
            warn!("worker returned");
        }
        if started.elapsed() >= self.crash_threshold {
            self.crashes = 0;
            return Step::Restarted;
        }
        self.crashes += 1;
        if self.crashes >= EMERGENCY_AFTER {
            warn!("worker is crash-looping, switching to the emergency worker");
            self.crashes = 0;
            while !(self.emergency)() {}
            return Step::Emergency;
        }
        if self.crashes >= SLOWDOWN_AFTER {
            thread::sleep(self.restart_pause);
        }
        Step::Restarted
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }
}

fn upload_log_tail(rt: &tokio::runtime::Runtime, api: &Api) {
    match log_buffer::tail(LOG_PATH, EMERGENCY_LOG_BYTES) {
        Ok(tail) if !tail.is_empty() => {
            if let Err(e) = rt.block_on(api.upload_log(&[tail])) {
                error!("emergency log upload failed: {}", e);
            }
        }
        _ => {}
    }
}

fn fetch_and_install(rt: &tokio::runtime::Runtime, api: &Api, url: &str) {
    info!("installing update from {}", url);
    let bytes = match rt.block_on(api.download(url)) {
        Ok(b) => b,
        Err(e) => {
            error!("update download failed: {}", e);
            return;
        }
    };
    let path = "/tmp/bitcalm-update";
    if let Err(e) = std::fs::write(path, &bytes) {
        error!("could not stage update: {}", e);
        return;
    }
    match Cmd::new("sh").arg(path).execute() {
        Ok(_) => {
            info!("update installed, restarting");
            std::process::exit(0);
        }
        Err(e) => error!("update install failed: {}", e),
    }
}

/// Restricted fallback when the main worker keeps dying: ship the local log
/// and poll the controller for instructions. Returns when the main worker
/// should be attempted again.
pub fn emergency_worker(config: &Config) -> Result<bool, Box<dyn Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let key = Status::load(STATUS_PATH).map(|s| s.key).unwrap_or_default();
    let api = Api::new(config, &key);

    upload_log_tail(&rt, &api);

    let mut deadline = Instant::now() + EMERGENCY_WINDOW;
    loop {
        match rt.block_on(api.emergency()) {
            Ok((200, commands)) => {
                if let Some(url) = commands.get("update").and_then(Value::as_str) {
                    fetch_and_install(&rt, &api, url);
                }
                if commands.get("log").and_then(Value::as_bool) == Some(true) {
                    upload_log_tail(&rt, &api);
                }
                match commands.get("worker").and_then(Value::as_i64) {
                    Some(1) => {
                        info!("controller asked for the main worker");
                        return Ok(true);
                    }
                    Some(-1) => {
                        // explicitly held back: keep waiting
                        deadline = Instant::now() + EMERGENCY_WINDOW;
                    }
                    _ => {}
                }
            }
            Ok((status, _)) => warn!("emergency poll returned {}", status),
            Err(e) => error!("emergency poll failed: {}", e),
        }
        if Instant::now() >= deadline {
            info!("emergency window elapsed, retrying the main worker");
            return Ok(true);
        }
        thread::sleep(EMERGENCY_POLL);
    }
}
