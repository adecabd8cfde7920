use std::error::Error;
use std::fs;
use std::path::{Path, MAIN_SEPARATOR};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pseudo-filesystems and bootstrap directories never worth backing up or
/// reporting in the filesystem image.
pub const IGNORE_DIRS: &[&str] = &[
    "sys", "dev", "root", "cdrom", "boot", "lost+found", "proc", "tmp", "sbin", "bin",
];

const COMPRESSED: &[&str] = &[
    "gz", "bz", "bz2", "z", "lzma", "gzip", "lz", "lzo", "xz", "7z", "zip", "tbz", "tbz2", "tgz",
    "rar", "sfx", "bzip", "bzip2", "deb", "rpm", "mint", "pet", "lzm", "ar", "jpg", "jpeg", "gif",
    "png", "mp3", "ogg",
];
const COMPRESSED_PARTS: &[&str] = &[r"7z\.\d{3}", r"r\d{2}", r"z\d{2}"];

/// Matches names of files that are already compressed and should be stored
/// verbatim. Compile once and reuse in hot loops.
pub fn compressed_re() -> Regex {
    let mut alts: Vec<String> = COMPRESSED.iter().map(|s| s.to_string()).collect();
    alts.extend(COMPRESSED_PARTS.iter().map(|s| s.to_string()));
    Regex::new(&format!(r"(?i).*\.(?:{})$", alts.join("|"))).unwrap()
}

pub fn is_file_compressed(path: &str) -> bool {
    compressed_re().is_match(path)
}

/// Splits the children of `path` into directory and non-directory names.
/// Unreadable directories count as empty.
pub fn ls(path: &str) -> (Vec<String>, Vec<String>) {
    let mut dirs = Vec::new();
    let mut others = Vec::new();
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(_) => return (dirs, others),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() {
            dirs.push(name);
        } else {
            others.push(name);
        }
    }
    (dirs, others)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with(MAIN_SEPARATOR) {
        format!("{}{}", parent, name)
    } else {
        format!("{}{}{}", parent, MAIN_SEPARATOR, name)
    }
}

fn is_link(parent: &str, name: &str) -> bool {
    fs::symlink_metadata(join(parent, name))
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(true)
}

/// Splits the children of `dir` into absolute subdirectory and file paths,
/// skipping symlinks. Used to expand the backup work queue one directory at
/// a time.
pub fn expand_dir(dir: &str) -> (Vec<String>, Vec<String>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return (dirs, files),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = join(dir, &entry.file_name().to_string_lossy());
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            dirs.push(path);
        } else if meta.is_file() {
            files.push(path);
        }
    }
    (dirs, files)
}

/// One directory of a breadth-first level: its path, child directory names
/// and child file names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelEntry {
    pub parent: String,
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Pending directories of the breadth-first walk, persisted between slices
/// so a restart resumes mid-walk.
pub type Cursor = Vec<(String, Vec<String>)>;

/// Breadth-first filesystem walk yielding one level at a time.
pub struct LevelWalk {
    items: Cursor,
    fresh: bool,
}

impl LevelWalk {
    pub fn start() -> LevelWalk {
        LevelWalk {
            items: Vec::new(),
            fresh: true,
        }
    }

    pub fn resume(cursor: Cursor) -> LevelWalk {
        LevelWalk {
            items: cursor,
            fresh: false,
        }
    }

    /// Queues a single changed path for re-walking on the next level.
    pub fn inject(&mut self, path: &str) {
        let p = Path::new(path);
        let parent = p
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !name.is_empty() {
            self.items.push((parent, vec![name]));
        }
    }

    pub fn next_level(&mut self) -> Option<(Vec<LevelEntry>, bool)> {
        if self.fresh {
            self.fresh = false;
            let (mut cdirs, cfiles) = ls("/");
            cdirs.retain(|d| !IGNORE_DIRS.contains(&d.as_str()));
            let level = vec![LevelEntry {
                parent: "/".to_string(),
                dirs: cdirs.clone(),
                files: cfiles,
            }];
            self.items = vec![("/".to_string(), cdirs)];
            let has_next = self
                .items
                .iter()
                .any(|(p, ds)| ds.iter().any(|d| !is_link(p, d)));
            if !has_next {
                self.items.clear();
            }
            return Some((level, has_next));
        }
        if self.items.is_empty() {
            return None;
        }
        let mut level = Vec::new();
        let mut next_items: Cursor = Vec::new();
        while let Some((parent, dirs)) = self.items.pop() {
            for d in dirs.iter().filter(|d| !is_link(&parent, d)) {
                let path = join(&parent, d);
                let (cdirs, cfiles) = ls(&path);
                if cdirs.is_empty() && cfiles.is_empty() {
                    continue;
                }
                if cdirs.iter().any(|c| !is_link(&path, c)) {
                    next_items.push((path.clone(), cdirs.clone()));
                }
                level.push(LevelEntry {
                    parent: path,
                    dirs: cdirs,
                    files: cfiles,
                });
            }
        }
        let has_next = !next_items.is_empty();
        self.items = next_items;
        Some((level, has_next))
    }

    pub fn into_cursor(self) -> Cursor {
        self.items
    }

    pub fn exhausted(&self) -> bool {
        !self.fresh && self.items.is_empty()
    }
}

/// Free bytes available to unprivileged writers on the filesystem holding
/// `path`.
pub fn free_space(path: &str) -> Result<u64, Box<dyn Error>> {
    let stat = nix::sys::statvfs::statvfs(Path::new(path))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

const CHANGELOG_CAP: usize = 4096;

/// Change feed filled by a filesystem watcher and drained by the worker.
/// Overflow coalesces into a full re-scan instead of dropping entries
/// silently.
#[derive(Default)]
pub struct ChangeLog {
    paths: Vec<String>,
    overflowed: bool,
}

impl ChangeLog {
    pub fn new() -> ChangeLog {
        ChangeLog::default()
    }

    pub fn push(&mut self, path: String) {
        if self.paths.len() >= CHANGELOG_CAP {
            self.overflowed = true;
            self.paths.clear();
        } else {
            self.paths.push(path);
        }
    }

    /// Returns the buffered paths and whether a full re-scan is required.
    pub fn drain(&mut self) -> (Vec<String>, bool) {
        let rescan = self.overflowed;
        self.overflowed = false;
        (std::mem::take(&mut self.paths), rescan)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && !self.overflowed
    }
}
