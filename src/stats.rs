//! Archive statistics.
//!
//! A quick summary of what an archive holds: per record kind for chunk
//! directories, sessions and checkpoints for databases, and channel / user
//! counts for every source. Used by `chatvault stats`.

use std::path::Path;

use anyhow::Result;
use chatvault_core::record::RecordKind;
use chatvault_core::source::SourceKind;
use sqlx::Row;

use crate::directory::Directory;
use crate::progress::format_number;
use crate::sources::{self, LoadOptions};
use crate::sqlite_store::SqliteStore;

/// Run the stats command: inspect the archive at `path` and print a summary.
pub async fn run_stats(path: &Path, db_file: &str) -> Result<()> {
    let found = sources::detect(path, db_file)?;
    let src = sources::load(
        path,
        &LoadOptions {
            session: None,
            db_file: Some(db_file.to_string()),
        },
    )
    .await?;

    println!("chatvault archive stats");
    println!("=======================");
    println!();
    println!("  Source:      {}", src.name());
    println!(
        "  Kind:        {}{}",
        found.kind,
        if found.zip { " (zip)" } else { "" }
    );
    if let Ok(meta) = std::fs::metadata(&found.path) {
        if meta.is_file() {
            println!("  Size:        {}", format_bytes(meta.len()));
        }
    }
    match src.workspace_info().await {
        Ok(ws) if !ws.team.is_empty() => println!("  Workspace:   {} ({})", ws.team, ws.team_id),
        Ok(ws) => println!("  Workspace:   {}", ws.team_id),
        Err(_) => println!("  Workspace:   unknown"),
    }
    let channels = src.channels().await.map(|c| c.len()).unwrap_or(0);
    let users = src.users().await.map(|u| u.len()).unwrap_or(0);
    println!("  Channels:    {}", format_number(channels as u64));
    println!("  Users:       {}", format_number(users as u64));

    match found.kind {
        SourceKind::Chunk => chunk_stats(&found.path)?,
        SourceKind::Database => db_stats(&found.path).await?,
        SourceKind::Export | SourceKind::Dump => {}
    }
    println!();
    Ok(())
}

fn chunk_stats(path: &Path) -> Result<()> {
    let dir = Directory::open(path)?;
    println!();
    println!("  By record kind:");
    println!(
        "  {:<18} {:>6} {:>8} {:>10} {:>10}",
        "KIND", "FILES", "RECORDS", "ELEMENTS", "SIZE"
    );
    println!("  {}", "-".repeat(58));
    for kind in RecordKind::ALL {
        let st = dir.stat(kind)?;
        if !st.is_present() {
            continue;
        }
        println!(
            "  {:<18} {:>6} {:>8} {:>10} {:>10}",
            kind.as_str(),
            st.files,
            format_number(st.records as u64),
            format_number(st.elements as u64),
            format_bytes(st.bytes)
        );
    }
    Ok(())
}

async fn db_stats(path: &Path) -> Result<()> {
    let store = SqliteStore::open(path).await?;
    let sessions = store.list_sessions().await?;
    let records = store.record_count(None).await?;
    println!();
    println!("  Sessions:    {}", sessions.len());
    println!("  Records:     {}", format_number(records.max(0) as u64));

    let rows = sqlx::query(
        "SELECT kind, COUNT(*) AS n FROM records GROUP BY kind ORDER BY kind",
    )
    .fetch_all(store.pool())
    .await?;
    if !rows.is_empty() {
        println!();
        println!("  {:<18} {:>8}", "KIND", "RECORDS");
        println!("  {}", "-".repeat(28));
        for row in &rows {
            let kind: String = row.get("kind");
            let n: i64 = row.get("n");
            println!("  {:<18} {:>8}", kind, format_number(n.max(0) as u64));
        }
    }

    if let Some(last) = sessions.iter().rev().find(|s| s.finished) {
        println!();
        println!(
            "  Last finished session: #{} ({}, {})",
            last.id,
            last.mode,
            format_ts_relative(last.created_at)
        );
    }
    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
