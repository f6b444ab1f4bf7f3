//! End-to-end archive, resume and conversion against an in-memory API.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chatvault::archive::{self, RunEnv, StoreKind, StoreSpec};
use chatvault::controller::{ControllerOptions, SearchType, Stage, State};
use chatvault::convert::{self, ConvertOptions, Format, TargetSpec};
use chatvault::directory::Directory;
use chatvault::resume::{self, ResumeError, ResumeOptions};
use chatvault::source_chunk::ChunkSource;
use chatvault::sources::{self, LoadOptions};
use chatvault::sqlite_store::SqliteStore;
use chatvault_core::entity::EntityList;
use chatvault_core::paths::FileLayout;
use chatvault_core::record::{Record, RecordKind};
use chatvault_core::source::{SourceKind, Sourcer};
use chatvault_core::unit::SlackLink;
use common::{file, msg, ts, FakeSlack};
use futures::TryStreamExt;
use tempfile::TempDir;

const DB_FILE: &str = "chatvault.sqlite";

fn store_at(root: &Path, kind: StoreKind) -> StoreSpec {
    StoreSpec {
        kind,
        path: root.to_path_buf(),
        db_file: DB_FILE.into(),
        args: "test".into(),
    }
}

fn opts() -> ControllerOptions {
    ControllerOptions {
        workers: 2,
        files: true,
        avatars: false,
        ..Default::default()
    }
}

async fn open_chunks(root: &Path) -> ChunkSource {
    ChunkSource::open(Arc::new(Directory::open(root).unwrap())).unwrap()
}

/// Records across every chunk file, duplicates included.
fn record_count(root: &Path) -> usize {
    let dir = Directory::open(root).unwrap();
    dir.stems()
        .unwrap()
        .iter()
        .map(|stem| dir.records(stem).unwrap().len())
        .sum()
}

async fn timeline(src: &dyn Sourcer, channel_id: &str) -> Vec<String> {
    src.all_messages(channel_id)
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.ts)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Archive
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn archive_whole_workspace_into_chunks() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();

    let summary = archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    assert!(summary.is_success(), "errors: {:?}", summary.errors);
    assert_eq!(summary.channels, 2);
    assert_eq!(summary.messages, 11);
    assert_eq!(summary.threads, 1);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.users, 2);
    assert_eq!(summary.downloads.files, 2);

    let dir = Directory::open(&root).unwrap();
    let stems = dir.stems().unwrap();
    let units: Vec<&String> = stems
        .iter()
        .filter(|s| s.starts_with('C'))
        .collect();
    assert_eq!(units, ["C1", "C2"]);
    assert!(stems.iter().any(|s| s == "users"));
    assert!(dir.has_sentinel());
    assert_eq!(dir.stat(RecordKind::Files).unwrap().elements, 2);

    let body = fs::read(root.join("__uploads/F1/a.txt")).unwrap();
    assert_eq!(body, b"body of https://files.example/F1/a.txt");
    assert!(root.join("__uploads/F2/b.txt").is_file());
}

#[tokio::test]
async fn records_follow_page_order() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::parse(&["C1"]).unwrap(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    let records = Directory::open(&root).unwrap().records("C1").unwrap();
    assert!(matches!(records[0], Record::ChannelInfo { .. }));
    let batches: Vec<&Record> = records
        .iter()
        .filter(|r| r.kind() == RecordKind::Messages)
        .collect();
    // ten messages in pages of three
    assert_eq!(batches.len(), 4);
    let mut prev = String::new();
    for b in &batches {
        let Record::Messages { messages, .. } = b else { unreachable!() };
        for m in messages {
            assert!(m.ts > prev, "{} after {}", m.ts, prev);
            prev = m.ts.clone();
        }
    }
    assert!(matches!(batches[3], Record::Messages { is_last: true, .. }));

    let src = open_chunks(&root).await;
    let ts_list = timeline(&src, "C1").await;
    let mut sorted = ts_list.clone();
    sorted.sort();
    assert_eq!(ts_list, sorted);
    assert_eq!(ts_list.len(), 10);

    let thread: Vec<String> = src
        .all_thread_messages("C1", &ts(3))
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.ts)
        .collect();
    assert_eq!(thread[0], ts(3));
    assert_eq!(thread.len(), 2);
}

#[tokio::test]
async fn failed_channel_does_not_stop_others() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    slack.fail("C2");

    let summary = archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.state, State::Done);
    assert!(!summary.is_success());
    assert_eq!(summary.errors.len(), 1);
    let err = &summary.errors[0];
    assert_eq!(err.stage, Stage::Stream);
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("C2"), "{}", err);

    let src = open_chunks(&root).await;
    assert_eq!(timeline(&src, "C1").await.len(), 10);
}

#[tokio::test]
async fn excluded_channels_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();

    let summary = archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::parse(&["^C1"]).unwrap(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.channels, 1);
    let dir = Directory::open(&root).unwrap();
    assert!(!dir.exists("C1"));
    assert!(dir.exists("C2"));
}

#[tokio::test]
async fn cancelled_run_is_aborted() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    let env = RunEnv::default();
    env.cancel.cancel();

    let summary = archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Database),
        &EntityList::new(),
        opts(),
        &env,
    )
    .await
    .unwrap();
    assert_eq!(summary.state, State::Aborted);
    assert!(!summary.is_success());

    let store = SqliteStore::open(&root.join(DB_FILE)).await.unwrap();
    assert_eq!(store.last_finished_session().await.unwrap(), None);
}

#[tokio::test]
async fn search_results_are_recorded() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();

    let summary = archive::search(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        "m1",
        SearchType::All,
        ControllerOptions {
            files: false,
            ..opts()
        },
        &RunEnv::default(),
    )
    .await
    .unwrap();
    assert!(summary.is_success());
    // "m1" and "m10"
    assert_eq!(summary.messages, 2);

    let dir = Directory::open(&root).unwrap();
    assert_eq!(dir.stat(RecordKind::SearchMessages).unwrap().elements, 2);
}

// ═══════════════════════════════════════════════════════════════════════
// Resume
// ═══════════════════════════════════════════════════════════════════════

async fn resume_chunks(slack: &Arc<FakeSlack>, root: &Path) -> chatvault::controller::Summary {
    archive::resume(
        &slack.remote(),
        root,
        DB_FILE,
        "test",
        &ResumeOptions::default(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn resume_fetches_only_new_messages() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    slack.post("C1", msg(20, "late"));
    let summary = resume_chunks(&slack, &root).await;
    assert!(summary.is_success(), "errors: {:?}", summary.errors);
    assert_eq!(summary.messages, 1);

    let src = open_chunks(&root).await;
    let all = timeline(&src, "C1").await;
    assert_eq!(all.len(), 11);
    assert_eq!(all.last().unwrap(), &ts(20));

    // nothing new: nothing written
    let records_before = record_count(&root);
    let latest_before = resume::latest_map(&src, true).await.unwrap();
    let again = resume_chunks(&slack, &root).await;
    assert!(again.is_success());
    assert_eq!(again.messages, 0);
    assert_eq!(record_count(&root), records_before);
    let src = open_chunks(&root).await;
    assert_eq!(resume::latest_map(&src, true).await.unwrap(), latest_before);
}

#[tokio::test]
async fn resume_into_database_chains_sessions() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    let first = archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Database),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();
    assert!(first.is_success(), "errors: {:?}", first.errors);

    slack.post("C1", msg(30, "later"));
    let second = archive::resume(
        &slack.remote(),
        &root,
        DB_FILE,
        "test",
        &ResumeOptions::default(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();
    assert!(second.is_success(), "errors: {:?}", second.errors);
    assert_eq!(second.messages, 1);

    let store = SqliteStore::open(&root.join(DB_FILE)).await.unwrap();
    let sessions = store.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[1].parent_id, Some(sessions[0].id));
    assert_eq!(sessions[1].mode, "resume");
    assert!(sessions.iter().all(|s| s.finished));

    let src = sources::load(
        &root,
        &LoadOptions {
            session: None,
            db_file: Some(DB_FILE.into()),
        },
    )
    .await
    .unwrap();
    assert_eq!(src.kind(), SourceKind::Database);
    assert_eq!(timeline(src.as_ref(), "C1").await.len(), 11);
}

#[tokio::test]
async fn resume_refuses_other_workspace() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    slack.set_team("T2");
    let err = archive::resume(
        &slack.remote(),
        &root,
        DB_FILE,
        "test",
        &ResumeOptions::default(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap_err();
    match err.downcast_ref::<ResumeError>() {
        Some(ResumeError::WorkspaceMismatch { stored, live }) => {
            assert_eq!(stored, "T1");
            assert_eq!(live, "T2");
        }
        None => panic!("unexpected error: {:#}", err),
    }
}

#[tokio::test]
async fn latest_leaves_out_threads_unless_asked() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    let src = open_chunks(&root).await;
    let thread = SlackLink::parse(&format!("C1:{}", ts(3))).unwrap();

    let map = resume::latest_map(&src, false).await.unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map[&SlackLink::parse("C1").unwrap()], ts(10));
    assert!(!map.contains_key(&thread));

    let map = resume::latest_map(&src, true).await.unwrap();
    assert_eq!(map[&thread], format!("{}.500000", common::T0 + 3));
}

// ═══════════════════════════════════════════════════════════════════════
// Conversion
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chunks_convert_to_export_with_files() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let out = tmp.path().join("export");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();

    let src: Arc<dyn Sourcer> = Arc::new(open_chunks(&root).await);
    let dst = TargetSpec::new(Format::Export, &out).with_layout(FileLayout::Standard);
    let summary = convert::convert(
        Some(src),
        Some(dst),
        &ConvertOptions {
            workers: 8,
            files: true,
            avatars: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.channels, 2);
    assert_eq!(summary.messages, 11);
    assert_eq!(summary.files.copied, 2);
    assert_eq!(summary.files.failed, 0);
    assert_eq!(summary.avatars.copied, 0);

    assert!(out.join("channels.json").is_file());
    assert!(out.join("users.json").is_file());
    assert!(out.join("general/attachments/F1-a.txt").is_file());
    assert!(out.join("general/attachments/F2-b.txt").is_file());
    let days: Vec<_> = fs::read_dir(out.join("general"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .collect();
    assert_eq!(days.len(), 1);

    // and the export reads back
    let back = sources::load(&out, &LoadOptions::default()).await.unwrap();
    assert_eq!(back.kind(), SourceKind::Export);
    assert_eq!(back.users().await.unwrap().len(), 2);
}

#[tokio::test]
async fn missing_upload_fails_only_that_file() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let out = tmp.path().join("export");
    let slack = FakeSlack::workspace();
    let mut with_file = msg(4, "c");
    with_file.files = vec![file("F3", "c.txt")];
    slack.post("C2", with_file);
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Chunk),
        &EntityList::new(),
        opts(),
        &RunEnv::default(),
    )
    .await
    .unwrap();
    fs::remove_file(root.join("__uploads/F1/a.txt")).unwrap();

    let src: Arc<dyn Sourcer> = Arc::new(open_chunks(&root).await);
    let summary = convert::convert(
        Some(src),
        Some(TargetSpec::new(Format::Export, &out)),
        &ConvertOptions {
            workers: 8,
            files: true,
            avatars: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.channels, 2);
    assert_eq!(summary.files.copied, 2);
    assert_eq!(summary.files.failed, 1);
    assert!(!out.join("general/attachments/F1-a.txt").exists());
    assert!(out.join("general/attachments/F2-b.txt").is_file());
    assert!(out.join("random/attachments/F3-c.txt").is_file());
}

#[tokio::test]
async fn database_converts_to_every_format() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("arch");
    let slack = FakeSlack::workspace();
    archive::archive(
        &slack.remote(),
        &store_at(&root, StoreKind::Database),
        &EntityList::new(),
        ControllerOptions {
            files: false,
            ..opts()
        },
        &RunEnv::default(),
    )
    .await
    .unwrap();

    for format in [Format::Chunk, Format::Database, Format::Export, Format::Dump] {
        let src: Arc<dyn Sourcer> = Arc::from(
            sources::load(
                &root,
                &LoadOptions {
                    session: None,
                    db_file: Some(DB_FILE.into()),
                },
            )
            .await
            .unwrap(),
        );
        let out = tmp.path().join(format!("out-{}", format.as_str()));
        let dst = TargetSpec::new(format, &out).with_db_file(DB_FILE);
        let summary = convert::convert(
            Some(src),
            Some(dst),
            &ConvertOptions {
                workers: 4,
                files: false,
                avatars: false,
            },
        )
        .await
        .unwrap_or_else(|e| panic!("{}: {}", format.as_str(), e));
        assert_eq!(summary.channels, 2, "{}", format.as_str());

        let back = sources::load(
            &out,
            &LoadOptions {
                session: None,
                db_file: Some(DB_FILE.into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(back.users().await.unwrap().len(), 2, "{}", format.as_str());
        assert_eq!(timeline(back.as_ref(), "C1").await.len(), 10, "{}", format.as_str());
    }
}
