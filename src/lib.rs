//! # chatvault
//!
//! A resumable, local-first archiver for Slack workspaces.
//!
//! chatvault streams conversations, threads, users and files from the Slack
//! Web API into a local archive, resumes interrupted or incremental runs from
//! what is already stored, and converts archives between four on-disk
//! formats.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ Slack API  │──▶│  Controller  │──▶│ RecordSink        │
//! │ (Streamer) │   │ worker pool  │   │ chunk dir / SQLite│
//! └────────────┘   └──────┬───────┘   └─────────┬─────────┘
//!                         │ files               │
//!                         ▼                     ▼
//!                  ┌─────────────┐      ┌──────────────┐   ┌──────────┐
//!                  │ DownloadPool│      │   Sourcer    │──▶│ Converter│──▶ Target
//!                  └─────────────┘      │ chunk/db/    │   └──────────┘
//!                                       │ export/dump  │
//!                                       └──────┬───────┘
//!                                              ▼
//!                                       resume: latest()
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chatvault archive                     # everything the token can see
//! chatvault archive C0123 ^C0456        # one channel, one excluded
//! chatvault resume ./archive            # fetch what is new since last run
//! chatvault convert ./archive ./out --format export
//! chatvault stats ./archive
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`archive`] | Archive, resume and search runs |
//! | [`controller`] | Concurrent, checkpointed ingestion |
//! | [`stream`] | API traits: [`stream::Streamer`], [`stream::Fetcher`] |
//! | [`slack_api`] | Slack Web API client |
//! | [`downloader`] | Bounded file download pool |
//! | [`sink`] | Where the controller writes records |
//! | [`chunkfile`] | Gzipped JSON-lines record files |
//! | [`directory`] | Chunk directory layout |
//! | [`sqlite_store`] | Relational store with sessions |
//! | [`storage`] | Directory or ZIP source filesystems |
//! | [`fsadapter`] | Directory or ZIP write targets |
//! | [`sources`] | Archive detection and loading |
//! | [`resume`] | Resume planning |
//! | [`convert`] | Format conversion engine |
//! | [`stats`] | Archive statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod chunkfile;
pub mod config;
pub mod controller;
pub mod convert;
pub mod db;
pub mod directory;
pub mod downloader;
pub mod fsadapter;
pub mod migrate;
pub mod progress;
pub mod resume;
pub mod sink;
pub mod slack_api;
pub mod source_chunk;
pub mod source_db;
pub mod source_dump;
pub mod source_export;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod storage;
pub mod stream;
