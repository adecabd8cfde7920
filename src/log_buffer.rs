use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};

pub const LOG_PATH: &str = "/var/log/bitcalm.log";

/// Error lines waiting to be shipped to the controller by the log upload
/// action.
pub type UploadBuffer = Arc<Mutex<Vec<String>>>;

/// File logger that tees error records into an in-memory buffer so the
/// worker can upload them.
pub struct AgentLog {
    file: Mutex<File>,
    buffer: UploadBuffer,
}

impl Log for AgentLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info && metadata.target().starts_with("bitcalm")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
        if record.level() == Level::Error {
            if let Ok(mut buffer) = self.buffer.lock() {
                buffer.push(line);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Installs the daemon logger and hands back the upload buffer.
pub fn init(path: &str) -> io::Result<UploadBuffer> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let buffer: UploadBuffer = Arc::new(Mutex::new(Vec::new()));
    let logger = AgentLog {
        file: Mutex::new(file),
        buffer: buffer.clone(),
    };
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    log::set_max_level(LevelFilter::Info);
    Ok(buffer)
}

/// Last `max_bytes` of a file, lossily decoded.
pub fn tail(path: &str, max_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
