use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chatvault::directory::Directory;
use chatvault_core::models::{Channel, Message, User, WorkspaceInfo};
use chatvault_core::record::Record;
use tempfile::TempDir;

fn chatvault_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("chatvault");
    path
}

fn run(config: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chatvault_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config)
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("SLACK_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chatvault binary at {:?}: {}", binary, e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

/// A small chunk archive and a config file pointing nowhere in particular.
fn setup() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let dir = Directory::create(&root).unwrap();
    dir.encode(Record::WorkspaceInfo {
        info: WorkspaceInfo {
            team: "Example".into(),
            team_id: "T1".into(),
            ..Default::default()
        },
    })
    .unwrap();
    dir.encode(Record::Users {
        users: vec![User {
            id: "U1".into(),
            name: "alice".into(),
            ..Default::default()
        }],
    })
    .unwrap();
    dir.encode(Record::Channels {
        channels: vec![Channel {
            id: "C1".into(),
            name: "general".into(),
            ..Default::default()
        }],
    })
    .unwrap();
    dir.encode(Record::Messages {
        channel_id: "C1".into(),
        is_last: true,
        thread_count: 0,
        messages: ["1700000001.000000", "1700000002.000000"]
            .iter()
            .map(|ts| Message {
                ts: ts.to_string(),
                text: "hello".into(),
                ..Default::default()
            })
            .collect(),
    })
    .unwrap();
    dir.close().unwrap();

    let config = tmp.path().join("chatvault.toml");
    fs::write(
        &config,
        format!(
            "[archive]\npath = \"{}\"\nworkers = 2\n\n[convert]\nworkers = 2\n",
            root.display()
        ),
    )
    .unwrap();
    (tmp, config, root)
}

#[test]
fn test_help() {
    let (_tmp, config, _) = setup();
    let (stdout, _, ok) = run(&config, &["--help"]);
    assert!(ok);
    for cmd in ["archive", "resume", "convert", "latest", "stats"] {
        assert!(stdout.contains(cmd), "missing {} in help", cmd);
    }
}

#[test]
fn test_stats() {
    let (_tmp, config, root) = setup();
    let (stdout, stderr, ok) = run(&config, &["stats", root.to_str().unwrap()]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("Example (T1)"), "{}", stdout);
    assert!(stdout.contains("messages"), "{}", stdout);
}

#[test]
fn test_latest() {
    let (_tmp, config, root) = setup();
    let (stdout, stderr, ok) = run(&config, &["latest", root.to_str().unwrap()]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("C1"));
    assert!(stdout.contains("1700000002.000000"));
}

#[test]
fn test_convert_to_dump() {
    let (tmp, config, root) = setup();
    let out = tmp.path().join("dump");
    let (stdout, stderr, ok) = run(
        &config,
        &[
            "convert",
            root.to_str().unwrap(),
            out.to_str().unwrap(),
            "--format",
            "dump",
            "--no-files",
        ],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("converted 1 channels"), "{}", stdout);
    assert!(out.join("C1.json").is_file());
    assert!(out.join("users.json").is_file());
}

#[test]
fn test_archive_without_token_fails() {
    let (_tmp, config, _) = setup();
    let (_, stderr, ok) = run(&config, &["archive", "C1"]);
    assert!(!ok);
    assert!(stderr.contains("SLACK_TOKEN"), "{}", stderr);
}

#[test]
fn test_sessions_rejects_chunk_archive() {
    let (_tmp, config, root) = setup();
    let (_, stderr, ok) = run(&config, &["sessions", root.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("not a database"), "{}", stderr);
}

#[test]
fn test_completions() {
    let (_tmp, config, _) = setup();
    let (stdout, _, ok) = run(&config, &["completions", "bash"]);
    assert!(ok);
    assert!(stdout.contains("chatvault"));
}
