//! # chatvault core
//!
//! Shared, I/O-free logic for chatvault: the typed record model, logical
//! unit identifiers, Slack timestamps, entity lists, on-disk path
//! conventions, and the [`source::Sourcer`] read abstraction.
//!
//! This crate contains no tokio, sqlx, or filesystem access. Storage
//! backends, the ingestion controller and the conversion engine live in
//! the `chatvault` crate and depend on the types defined here.

pub mod entity;
pub mod models;
pub mod paths;
pub mod record;
pub mod source;
pub mod ts;
pub mod unit;
