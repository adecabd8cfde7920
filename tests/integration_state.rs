use std::fs;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use bitcalm::catalog::{Catalog, CatalogEntry};
use bitcalm::config::{Config, DbCredentials};
use bitcalm::schedule::{Cadence, Schedule};
use bitcalm::status::{bak_path, BackupItems, BackupState, Phase, S3Access, Status};

mod common;

fn sample_status(path: &str) -> Status {
    let mut schedule = Schedule::new(
        4,
        chrono::NaiveTime::from_hms(2, 30, 0),
        Cadence::Weekly { days: 18 },
    );
    schedule.files.insert("/etc".to_string());
    schedule.prev_backup = Some(Utc.ymd(2021, 6, 1).and_hms(2, 30, 0));

    let mut status = Status::default();
    status.path = path.to_string();
    status.key = "11111111-2222-3333-4444-555555555555".to_string();
    status.is_registered = true;
    status.schedules = vec![schedule];
    status.database = vec![DbCredentials {
        host: "localhost".to_string(),
        port: 3306,
        user: "backup".to_string(),
        passwd: "secret".to_string(),
    }];
    status.amazon = Some(S3Access {
        key_id: "AK".to_string(),
        secret_key: "SK".to_string(),
        bucket: "bucket".to_string(),
        user: "u1".to_string(),
    });
    status.backup = Some(BackupState {
        backup_id: 9,
        schedule_id: 4,
        phase: Phase::Filesystem,
        is_full: true,
        items: Some(BackupItems {
            dirs: vec!["/etc".to_string()],
            files: vec!["/etc/hosts".to_string()],
        }),
        databases: None,
        size: 120,
        files_count: 1,
    });
    status
}

#[test]
fn status_survives_a_corrupt_primary() {
    common::log_init("integration_state");
    let dir = common::scratch_dir();
    let path = dir.join("data").to_string_lossy().into_owned();

    let original = sample_status(&path);
    original.save().unwrap();

    // a successful load refreshes the fallback copy
    let loaded = Status::load(&path).unwrap();
    assert_eq!(loaded, original);
    assert!(fs::metadata(bak_path(&path)).is_ok());

    fs::write(&path, b"not json at all").unwrap();
    let recovered = Status::load(&path).unwrap();
    assert_eq!(recovered, original);
}

#[test]
fn fresh_status_generates_an_install_key() {
    let dir = common::scratch_dir();
    let path = dir.join("data").to_string_lossy().into_owned();
    let status = Status::load(&path).unwrap();
    assert!(!status.key.is_empty());
    // the key survives a reload
    let again = Status::load(&path).unwrap();
    assert_eq!(again.key, status.key);
}

#[test]
fn corrupt_primary_and_fallback_is_an_error() {
    let dir = common::scratch_dir();
    let path = dir.join("data").to_string_lossy().into_owned();
    fs::write(&path, b"garbage").unwrap();
    fs::write(bak_path(&path), b"garbage too").unwrap();
    assert!(Status::load(&path).is_err());
}

fn entry(path: &str, mtime: f64, backup_id: i64) -> CatalogEntry {
    CatalogEntry {
        path: path.to_string(),
        hash_key: true,
        mtime,
        size: 120,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        compress: true,
        backup_id,
    }
}

#[test]
fn catalog_upsert_and_incremental_oracle() {
    let dir = common::scratch_dir();
    let catalog = Catalog::open(dir.join("backup.db"));
    assert!(!catalog.has_rows().unwrap());

    // never seen: upload
    assert!(catalog.is_modified("/etc/hosts", 100.0).unwrap());
    catalog.upsert(&entry("/etc/hosts", 100.0, 1)).unwrap();
    assert!(catalog.has_rows().unwrap());

    // recorded mtime is current: skip
    assert!(!catalog.is_modified("/etc/hosts", 100.0).unwrap());
    // file moved forward: upload again
    assert!(catalog.is_modified("/etc/hosts", 101.0).unwrap());

    // upsert replaces, never duplicates
    catalog.upsert(&entry("/etc/hosts", 101.0, 2)).unwrap();
    assert_eq!(catalog.count().unwrap(), 1);
    assert_eq!(catalog.mtime("/etc/hosts").unwrap(), Some(101.0));
}

#[test]
fn catalog_manifest_selection() {
    let dir = common::scratch_dir();
    let catalog = Catalog::open(dir.join("backup.db"));
    catalog.upsert(&entry("/a", 1.0, 1)).unwrap();
    catalog.upsert(&entry("/b", 2.0, 2)).unwrap();
    catalog.upsert(&entry("/c", 3.0, 3)).unwrap();

    assert!(catalog.has_backup(2).unwrap());
    assert!(!catalog.has_backup(9).unwrap());

    let manifest = catalog.entries_up_to(2).unwrap();
    let paths: Vec<&str> = manifest.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/a", "/b"]);
}

#[test]
fn catalog_truncate_resets_the_baseline() {
    let dir = common::scratch_dir();
    let catalog = Catalog::open(dir.join("backup.db"));
    catalog.upsert(&entry("/a", 1.0, 1)).unwrap();
    catalog.truncate().unwrap();
    assert!(!catalog.has_rows().unwrap());
    assert!(catalog.is_modified("/a", 1.0).unwrap());
}

#[test]
fn catalog_schema_upgrade_is_idempotent() {
    let dir = common::scratch_dir();
    let path = dir.join("backup.db");
    {
        let catalog = Catalog::open(&path);
        catalog.upsert(&entry("/a", 1.0, 1)).unwrap();
    }
    // a second open runs the upgrade statements again
    let catalog = Catalog::open(&path);
    assert_eq!(catalog.count().unwrap(), 1);
    let row = &catalog.entries().unwrap()[0];
    assert_eq!(row.backup_id, 1);
    assert!(row.compress);
}

#[test]
fn catalog_absorbs_a_downloaded_manifest() {
    let dir = common::scratch_dir();
    let local = Catalog::open(dir.join("backup.db"));
    local.upsert(&entry("/a", 5.0, 3)).unwrap();

    let baseline = Catalog::open(dir.join("baseline.db"));
    baseline.upsert(&entry("/a", 1.0, 1)).unwrap();
    baseline.upsert(&entry("/b", 2.0, 1)).unwrap();

    assert_eq!(local.absorb(&baseline).unwrap(), 2);
    assert_eq!(local.count().unwrap(), 2);
    // the absorbed row wins, matching what the remote manifest records
    assert_eq!(local.mtime("/a").unwrap(), Some(1.0));
}

const SAMPLE_CONF: &str = "
# agent identity
uuid = 11111111-2222-3333-4444-555555555555
host = controller.example.com  # overridden host
port = 8443
https = 1
database = localhost;backup;secret
database = 10.0.0.5:3307;admin
";

#[test]
fn config_parses_entries_and_comments() {
    let config = Config::parse(SAMPLE_CONF, "test.conf").unwrap();
    assert_eq!(config.uuid, "11111111-2222-3333-4444-555555555555");
    assert_eq!(config.host, "controller.example.com");
    assert_eq!(config.port, 8443);
    assert!(config.https);
    assert_eq!(
        config.database,
        vec![
            DbCredentials {
                host: "localhost".to_string(),
                port: 3306,
                user: "backup".to_string(),
                passwd: "secret".to_string(),
            },
            DbCredentials {
                host: "10.0.0.5".to_string(),
                port: 3307,
                user: "admin".to_string(),
                passwd: String::new(),
            },
        ]
    );
}

#[test]
fn config_defaults() {
    let config =
        Config::parse("uuid = 11111111-2222-3333-4444-555555555555", "test.conf").unwrap();
    assert_eq!(config.host, "bitcalm.com");
    assert_eq!(config.port, 443);
    assert!(config.https);
    assert!(config.database.is_empty());
}

#[test]
fn config_requires_a_uuid() {
    assert!(Config::parse("host = example.com", "test.conf").is_err());
}

#[test]
fn config_rejects_bad_entries() {
    assert!(Config::parse("uuid = not-a-uuid", "test.conf").is_err());
    assert!(Config::parse(
        "uuid = 11111111-2222-3333-4444-555555555555\ndatabase = ;;;",
        "test.conf"
    )
    .is_err());
    assert!(Config::parse(
        "uuid = 11111111-2222-3333-4444-555555555555\nshoe_size = 44",
        "test.conf"
    )
    .is_err());
    assert!(Config::parse("uuid", "test.conf").is_err());
}
