use std::{error::Error, fmt, fs};

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONF: &str = "/etc/bitcalm.conf";

const COMMENT_SYMBOL: char = '#';
const DEFAULT_HOST: &str = "bitcalm.com";
const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_DB_PORT: u16 = 3306;

const UUID_PATTERN: &str =
    "^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$";
const DB_PATTERN: &str =
    r"^((?:[\.\w]+)|(?:(?:\d{1,3}\.){3}\d{1,3}))(?::(\d+))?;(\w+)(?:;(\w+))?$";

#[derive(Debug)]
pub enum ConfigError {
    Syntax { line: usize },
    Entry { entry: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Syntax { line } => {
                write!(f, "Invalid config syntax at line {}", line)
            }
            ConfigError::Entry { entry, reason } => {
                write!(f, "Bad config entry {}: {}", entry, reason)
            }
        }
    }
}

impl Error for ConfigError {}

/// MySQL credentials, either from the config file or pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub passwd: String,
}

/// Immutable agent configuration read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub uuid: String,
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub database: Vec<DbCredentials>,
    pub filename: String,
}

impl Config {
    pub fn read(filename: &str) -> Result<Config, Box<dyn Error>> {
        let text = fs::read_to_string(filename)?;
        Ok(Config::parse(&text, filename)?)
    }

    pub fn parse(text: &str, filename: &str) -> Result<Config, ConfigError> {
        let uuid_re = Regex::new(UUID_PATTERN).unwrap();
        let db_re = Regex::new(DB_PATTERN).unwrap();

        let mut uuid = None;
        let mut host = None;
        let mut port = None;
        let mut https = None;
        let mut database = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let line = raw.split(COMMENT_SYMBOL).next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, '=');
            let entry = parts.next().unwrap_or("").trim();
            let value = parts.next().map(str::trim).unwrap_or("");
            if entry.is_empty() || value.is_empty() {
                return Err(ConfigError::Syntax { line: i + 1 });
            }
            match entry {
                "uuid" => {
                    if !uuid_re.is_match(value) {
                        return Err(ConfigError::Entry {
                            entry: entry.to_string(),
                            reason: format!("wrong uuid: {}", value),
                        });
                    }
                    uuid = Some(value.to_string());
                }
                "host" => host = Some(value.to_string()),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| ConfigError::Entry {
                        entry: entry.to_string(),
                        reason: format!("wrong port: {}", value),
                    })?);
                }
                "https" => {
                    https = Some(value.parse::<i32>().map_err(|_| ConfigError::Entry {
                        entry: entry.to_string(),
                        reason: format!("wrong https flag: {}", value),
                    })? != 0);
                }
                "database" => {
                    let caps = db_re.captures(value).ok_or_else(|| ConfigError::Entry {
                        entry: entry.to_string(),
                        reason: format!("wrong database: {}", value),
                    })?;
                    database.push(DbCredentials {
                        host: caps[1].to_string(),
                        port: caps
                            .get(2)
                            .map(|m| m.as_str().parse().unwrap_or(DEFAULT_DB_PORT))
                            .unwrap_or(DEFAULT_DB_PORT),
                        user: caps[3].to_string(),
                        passwd: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
                    });
                }
                _ => {
                    return Err(ConfigError::Entry {
                        entry: entry.to_string(),
                        reason: format!("disallowed entry: {}", entry),
                    });
                }
            }
        }

        Ok(Config {
            uuid: uuid.ok_or_else(|| ConfigError::Entry {
                entry: "uuid".to_string(),
                reason: format!("there is no uuid in config file ({})", filename),
            })?,
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.unwrap_or(DEFAULT_PORT),
            https: https.unwrap_or(true),
            database,
            filename: filename.to_string(),
        })
    }
}
