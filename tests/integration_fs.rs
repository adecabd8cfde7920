use std::fs;
use std::os::unix::fs::symlink;

use pretty_assertions::assert_eq;

use bitcalm::backup::{gunzip_bytes, gzip_bytes};
use bitcalm::filesystem::{
    expand_dir, free_space, is_file_compressed, ls, ChangeLog, LevelWalk,
};
use bitcalm::log_buffer;

mod common;

#[test]
fn compressed_names_are_recognized() {
    for name in &[
        "/srv/backup.tar.gz",
        "/srv/photo.JPG",
        "/srv/music.mp3",
        "/srv/package.deb",
        "/srv/archive.7z.001",
        "/srv/part.r01",
    ] {
        assert!(is_file_compressed(name), "{} should be compressed", name);
    }
    for name in &["/etc/hosts", "/srv/data.sql", "/srv/notes.txt", "/srv/gz"] {
        assert!(!is_file_compressed(name), "{} should not be compressed", name);
    }
}

#[test]
fn expand_dir_skips_symlinks() {
    let dir = common::scratch_dir();
    fs::write(dir.join("plain.txt"), b"x").unwrap();
    fs::create_dir(dir.join("sub")).unwrap();
    fs::write(dir.join("sub/nested.txt"), b"y").unwrap();
    symlink(dir.join("plain.txt"), dir.join("link.txt")).unwrap();
    symlink(dir.join("sub"), dir.join("sublink")).unwrap();

    let (dirs, files) = expand_dir(&dir.to_string_lossy());
    assert_eq!(dirs, vec![dir.join("sub").to_string_lossy().into_owned()]);
    assert_eq!(files, vec![dir.join("plain.txt").to_string_lossy().into_owned()]);
}

#[test]
fn ls_splits_dirs_from_files() {
    let dir = common::scratch_dir();
    fs::write(dir.join("a.txt"), b"x").unwrap();
    fs::create_dir(dir.join("b")).unwrap();
    let (dirs, files) = ls(&dir.to_string_lossy());
    assert_eq!(dirs, vec!["b".to_string()]);
    assert_eq!(files, vec!["a.txt".to_string()]);
    let (dirs, files) = ls("/definitely/not/a/dir");
    assert!(dirs.is_empty() && files.is_empty());
}

#[test]
fn level_walk_descends_and_resumes() {
    common::log_init("integration_fs");
    let root = common::scratch_dir();
    fs::create_dir_all(root.join("a/deep")).unwrap();
    fs::write(root.join("a/one.txt"), b"1").unwrap();
    fs::write(root.join("a/deep/two.txt"), b"2").unwrap();

    let mut walk = LevelWalk::resume(vec![(
        root.to_string_lossy().into_owned(),
        vec!["a".to_string()],
    )]);

    let (level, has_next) = walk.next_level().unwrap();
    assert_eq!(level.len(), 1);
    assert_eq!(level[0].parent, root.join("a").to_string_lossy());
    assert_eq!(level[0].dirs, vec!["deep".to_string()]);
    assert_eq!(level[0].files, vec!["one.txt".to_string()]);
    assert!(has_next);

    // persist the cursor mid-walk and pick it back up
    let cursor = walk.into_cursor();
    let mut resumed = LevelWalk::resume(cursor);
    let (level, has_next) = resumed.next_level().unwrap();
    assert_eq!(level[0].parent, root.join("a/deep").to_string_lossy());
    assert_eq!(level[0].files, vec!["two.txt".to_string()]);
    assert!(!has_next);
    assert!(resumed.next_level().is_none());
}

#[test]
fn level_walk_injection_requeues_a_subtree() {
    let root = common::scratch_dir();
    fs::create_dir_all(root.join("changed")).unwrap();
    fs::write(root.join("changed/file.txt"), b"x").unwrap();

    let mut walk = LevelWalk::resume(Vec::new());
    assert!(walk.next_level().is_none());

    walk.inject(&root.join("changed").to_string_lossy());
    let (level, _) = walk.next_level().unwrap();
    assert_eq!(level.len(), 1);
    assert_eq!(level[0].files, vec!["file.txt".to_string()]);
}

#[test]
fn changelog_overflow_coalesces_into_a_rescan() {
    let mut log = ChangeLog::new();
    assert!(log.is_empty());
    log.push("/etc/hosts".to_string());
    let (paths, rescan) = log.drain();
    assert_eq!(paths, vec!["/etc/hosts".to_string()]);
    assert!(!rescan);

    for i in 0..5000 {
        log.push(format!("/var/spool/{}", i));
    }
    let (paths, rescan) = log.drain();
    assert!(rescan);
    assert!(paths.len() < 5000);
    // drained: the next slice starts clean
    let (paths, rescan) = log.drain();
    assert!(paths.is_empty() && !rescan);
}

#[test]
fn free_space_reports_something_for_tmp() {
    assert!(free_space("/tmp").unwrap() > 0);
}

#[test]
fn gzip_round_trip() {
    let data = b"some dump output, repeated repeated repeated".to_vec();
    let packed = gzip_bytes(&data).unwrap();
    assert_ne!(packed, data);
    assert_eq!(gunzip_bytes(&packed).unwrap(), data);
}

#[test]
fn log_tail_returns_the_last_bytes() {
    let dir = common::scratch_dir();
    let path = dir.join("agent.log");
    fs::write(&path, b"0123456789").unwrap();
    let tail = log_buffer::tail(&path.to_string_lossy(), 4).unwrap();
    assert_eq!(tail, "6789");
    let all = log_buffer::tail(&path.to_string_lossy(), 100).unwrap();
    assert_eq!(all, "0123456789");
}
