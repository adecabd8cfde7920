use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, NO_PARAMS};

pub const CATALOG_PATH: &str = "/var/lib/bitcalm/backup.db";

/// One backed-up file: the incremental oracle row and the manifest entry
/// are the same record.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub path: String,
    /// True for the hash-key layout; false only for rows imported from
    /// manifests written in the legacy path layout.
    pub hash_key: bool,
    pub mtime: f64,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Whether the stored object is gzip-compressed by the agent.
    pub compress: bool,
    pub backup_id: i64,
}

/// Local database of previously backed-up files. Connections are opened per
/// operation; cross-process access is not a goal.
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Catalog {
        Catalog {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        init_schema(&conn)?;
        Ok(conn)
    }

    pub fn has_rows(&self) -> rusqlite::Result<bool> {
        Ok(self.count()? > 0)
    }

    pub fn count(&self) -> rusqlite::Result<i64> {
        let conn = self.connect()?;
        conn.query_row("SELECT COUNT(*) FROM backup", NO_PARAMS, |row| row.get(0))
    }

    pub fn truncate(&self) -> rusqlite::Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM backup", NO_PARAMS)?;
        Ok(())
    }

    pub fn mtime(&self, path: &str) -> rusqlite::Result<Option<f64>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT mtime FROM backup WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
    }

    /// The incremental decision: a file goes into the backup when the
    /// catalog has never seen it or its recorded mtime is older.
    pub fn is_modified(&self, path: &str, mtime: f64) -> rusqlite::Result<bool> {
        Ok(match self.mtime(path)? {
            Some(prev) => prev < mtime,
            None => true,
        })
    }

    pub fn upsert(&self, entry: &CatalogEntry) -> rusqlite::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO backup
                 (path, hash_key, mtime, size, mode, uid, gid, compress, backup_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.path,
                entry.hash_key as i64,
                entry.mtime,
                entry.size,
                entry.mode,
                entry.uid,
                entry.gid,
                entry.compress as i64,
                entry.backup_id,
            ],
        )?;
        Ok(())
    }

    pub fn entries(&self) -> rusqlite::Result<Vec<CatalogEntry>> {
        self.select("SELECT * FROM backup ORDER BY path", NO_PARAMS)
    }

    /// Manifest of a given backup: every row written up to and including it.
    /// Incremental backups reference files carried over from earlier ones,
    /// so older rows belong to the manifest too.
    pub fn entries_up_to(&self, backup_id: i64) -> rusqlite::Result<Vec<CatalogEntry>> {
        self.select(
            "SELECT * FROM backup WHERE backup_id <= ?1 ORDER BY path",
            params![backup_id],
        )
    }

    pub fn has_backup(&self, backup_id: i64) -> rusqlite::Result<bool> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backup WHERE backup_id = ?1",
            params![backup_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn select<P>(&self, sql: &str, params: P) -> rusqlite::Result<Vec<CatalogEntry>>
    where
        P: IntoIterator,
        P::Item: rusqlite::ToSql,
    {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(CatalogEntry {
                path: row.get("path")?,
                hash_key: row.get::<_, i64>("hash_key")? != 0,
                mtime: row.get("mtime")?,
                size: row.get("size")?,
                mode: row.get::<_, i64>("mode")? as u32,
                uid: row.get::<_, i64>("uid")? as u32,
                gid: row.get::<_, i64>("gid")? as u32,
                compress: row.get::<_, i64>("compress")? != 0,
                backup_id: row.get("backup_id")?,
            })
        })?;
        rows.collect()
    }

    /// Merges every row of another catalog file into this one, e.g. a
    /// downloaded manifest serving as the incremental baseline.
    pub fn absorb(&self, other: &Catalog) -> rusqlite::Result<usize> {
        let mut n = 0;
        for entry in other.entries()? {
            self.upsert(&entry)?;
            n += 1;
        }
        Ok(n)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS backup (
             path TEXT PRIMARY KEY,
             hash_key INT,
             mtime REAL,
             size INT,
             mode INT,
             uid INT,
             gid INT,
             compress INT,
             backup_id INT
         )",
        NO_PARAMS,
    )?;
    // Columns added after the first release; older files gain them here.
    for column in &["compress INT", "backup_id INT"] {
        if let Err(e) = conn.execute(&format!("ALTER TABLE backup ADD COLUMN {}", column), NO_PARAMS)
        {
            let msg = e.to_string();
            if !msg.contains("duplicate column name") {
                return Err(e);
            }
        }
    }
    Ok(())
}
