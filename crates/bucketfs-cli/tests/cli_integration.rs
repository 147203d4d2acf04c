//! End-to-end tests of the `bucketfs` binary against a native backend in a
//! temporary directory.
//!
//! Run: `cargo nextest run -p bucketfs-cli cli_integration`

#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn bucketfs(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("bucketfs").unwrap();
    cmd.env_remove("BUCKETFS_CONFIG").arg("--root").arg(root.path());
    cmd
}

// ============================================================================
// Basic CLI tests
// ============================================================================

#[test]
fn test_help() {
    Command::cargo_bin("bucketfs")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ls"))
        .stdout(predicate::str::contains("write"))
        .stdout(predicate::str::contains("stats"));
}

#[test]
fn test_native_backend_requires_root() {
    Command::cargo_bin("bucketfs")
        .unwrap()
        .env_remove("BUCKETFS_CONFIG")
        .args(["--backend", "native", "ls"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--root"));
}

#[test]
fn test_memory_backend_starts_empty() {
    Command::cargo_bin("bucketfs")
        .unwrap()
        .env_remove("BUCKETFS_CONFIG")
        .args(["--backend", "memory", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

// ============================================================================
// File commands
// ============================================================================

#[test]
fn test_write_then_cat() {
    let root = TempDir::new().unwrap();
    bucketfs(&root)
        .args(["write", "/hello.txt"])
        .write_stdin("hello world")
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote 11 bytes"));

    assert_eq!(fs::read_to_string(root.path().join("hello.txt")).unwrap(), "hello world");
    bucketfs(&root)
        .args(["cat", "hello.txt"])
        .assert()
        .success()
        .stdout("hello world");
}

#[test]
fn test_write_append() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("log"), "one\n").unwrap();
    bucketfs(&root)
        .args(["write", "--append", "/log"])
        .write_stdin("two\n")
        .assert()
        .success();
    assert_eq!(fs::read_to_string(root.path().join("log")).unwrap(), "one\ntwo\n");
}

#[test]
fn test_cat_missing_file_exit_code() {
    let root = TempDir::new().unwrap();
    bucketfs(&root).args(["cat", "/nope"]).assert().code(3);
}

#[test]
fn test_stat_json() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("f.bin"), vec![0u8; 1234]).unwrap();
    let output = bucketfs(&root).args(["stat", "--json", "/f.bin"]).output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["size"], 1234);
    assert_eq!(json["kind"], "file");
}

// ============================================================================
// Namespace commands
// ============================================================================

#[test]
fn test_mkdir_parents_and_ls() {
    let root = TempDir::new().unwrap();
    bucketfs(&root).args(["mkdir", "-p", "/a/b/c"]).assert().success();
    assert!(root.path().join("a/b/c").is_dir());
    fs::write(root.path().join("a/file.txt"), "x").unwrap();

    bucketfs(&root)
        .args(["ls", "/a"])
        .assert()
        .success()
        .stdout("b/\nfile.txt\n");
    bucketfs(&root)
        .args(["ls", "-l", "/a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("file.txt").and(predicate::str::contains("dir")));
}

#[test]
fn test_ls_json() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("z"), "zz").unwrap();
    let output = bucketfs(&root).args(["ls", "--json"]).output().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["path"], "/");
    assert_eq!(json["entries"][0]["name"], "z");
    assert_eq!(json["entries"][0]["size"], 2);
}

#[test]
fn test_rm_non_empty_directory_needs_recursive() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("d/e")).unwrap();
    fs::write(root.path().join("d/e/f"), "f").unwrap();

    bucketfs(&root).args(["rm", "/d"]).assert().code(5);
    bucketfs(&root)
        .args(["rm", "-r", "/d"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Deleted 1 files and 2 directories"));
    assert!(!root.path().join("d").exists());
}

#[test]
fn test_rm_force_ignores_missing() {
    let root = TempDir::new().unwrap();
    bucketfs(&root).args(["rm", "-f", "/ghost"]).assert().success();
    bucketfs(&root).args(["rm", "/ghost"]).assert().code(3);
}

#[test]
fn test_mv_file() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("old"), "data").unwrap();
    fs::create_dir(root.path().join("dir")).unwrap();
    bucketfs(&root).args(["mv", "/old", "/dir/new"]).assert().success();
    assert!(!root.path().join("old").exists());
    assert_eq!(fs::read_to_string(root.path().join("dir/new")).unwrap(), "data");
}

#[test]
fn test_stats_reports_warm_reads() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("blob"), vec![7u8; 10_000]).unwrap();
    let output = bucketfs(&root).args(["stats", "--json", "/blob"]).output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["fetches"], 1);
    assert!(json["hits"].as_u64().unwrap() >= 1);
}
