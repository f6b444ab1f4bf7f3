//! Conversion preconditions.

use std::sync::Arc;

use chatvault::convert::{self, ConvertError, ConvertOptions, Format, TargetSpec};
use chatvault::directory::Directory;
use chatvault::source_chunk::ChunkSource;
use chatvault::sqlite_store::SqliteStore;
use chatvault_core::models::{Channel, Message, User, WorkspaceInfo};
use chatvault_core::paths::FileLayout;
use chatvault_core::record::Record;
use chatvault_core::source::Sourcer;
use tempfile::TempDir;

/// A chunk directory with one channel, optionally with a user list.
fn archive(root: &std::path::Path, users: bool) -> Arc<dyn Sourcer> {
    let dir = Directory::create(root).unwrap();
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
        messages: vec![Message {
            ts: "1700000001.000000".into(),
            text: "hi".into(),
            ..Default::default()
        }],
    })
    .unwrap();
    if users {
        dir.encode(Record::Users {
            users: vec![User {
                id: "U1".into(),
                name: "alice".into(),
                ..Default::default()
            }],
        })
        .unwrap();
    }
    dir.encode(Record::WorkspaceInfo {
        info: WorkspaceInfo {
            team_id: "T1".into(),
            ..Default::default()
        },
    })
    .unwrap();
    dir.close().unwrap();
    Arc::new(ChunkSource::open(Arc::new(Directory::open(root).unwrap())).unwrap())
}

#[tokio::test]
async fn no_users_blocks_every_format() {
    let tmp = TempDir::new().unwrap();
    let src = archive(&tmp.path().join("src"), false);

    for format in [Format::Chunk, Format::Database, Format::Export, Format::Dump] {
        let out = tmp.path().join(format!("out-{}", format.as_str()));
        let err = convert::convert(
            Some(Arc::clone(&src)),
            Some(TargetSpec::new(format, &out).with_db_file("c.sqlite")),
            &ConvertOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, ConvertError::NoUsers(_)),
            "{}: {}",
            format.as_str(),
            err
        );
        assert!(!out.exists(), "{} left output behind", format.as_str());
    }
}

#[tokio::test]
async fn failed_validation_writes_no_zip() {
    let tmp = TempDir::new().unwrap();
    let src = archive(&tmp.path().join("src"), false);
    for format in [Format::Export, Format::Dump] {
        let out = tmp.path().join(format!("{}.zip", format.as_str()));
        let err = convert::convert(
            Some(Arc::clone(&src)),
            Some(TargetSpec::new(format, &out)),
            &ConvertOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConvertError::NoUsers(_)));
        assert!(!out.exists(), "{}", out.display());
    }
}

#[tokio::test]
async fn source_and_target_are_required() {
    let tmp = TempDir::new().unwrap();
    let src = archive(&tmp.path().join("src"), true);
    let opts = ConvertOptions::default();

    let err = convert::convert(Some(src), None, &opts).await.unwrap_err();
    assert!(matches!(err, ConvertError::NoTarget));

    let out = tmp.path().join("out");
    let err = convert::convert(None, Some(TargetSpec::new(Format::Dump, &out)), &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::NoSource));
    assert!(!out.exists());
}

#[tokio::test]
async fn export_rejects_dump_layout() {
    let tmp = TempDir::new().unwrap();
    let src = archive(&tmp.path().join("src"), true);
    let out = tmp.path().join("out");
    let dest = TargetSpec::new(Format::Export, &out).with_layout(FileLayout::Dump);
    assert!(dest.check().is_err());

    let err = convert::convert(Some(src), Some(dest), &ConvertOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::InvalidTarget(_)), "{}", err);
    assert!(!out.exists());
}

#[test]
fn chunk_and_database_refuse_zip_paths() {
    for format in [Format::Chunk, Format::Database] {
        assert!(TargetSpec::new(format, "out.zip").check().is_err());
    }
    assert!(TargetSpec::new(Format::Dump, "out.zip").check().is_ok());
}

#[tokio::test]
async fn database_session_records_requested_options() {
    let tmp = TempDir::new().unwrap();
    let src = archive(&tmp.path().join("src"), true);
    let out = tmp.path().join("db");
    convert::convert(
        Some(src),
        Some(
            TargetSpec::new(Format::Database, &out)
                .with_db_file("c.sqlite")
                .with_args("convert src db --format database --no-files"),
        ),
        &ConvertOptions {
            workers: 2,
            files: false,
            avatars: false,
        },
    )
    .await
    .unwrap();

    let store = SqliteStore::open(&out.join("c.sqlite")).await.unwrap();
    let sessions = store.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.mode, "convert");
    assert!(s.finished);
    assert!(!s.files_enabled);
    assert!(!s.avatars_enabled);
    assert_eq!(s.args, "convert src db --format database --no-files");
    store.close().await;
}
