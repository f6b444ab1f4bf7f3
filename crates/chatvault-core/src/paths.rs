//! On-disk naming conventions for attachments and avatars.
//!
//! | Layout | Path |
//! |--------|------|
//! | mattermost | `__uploads/<file id>/<name>` |
//! | standard | `<channel>/attachments/<file id>-<name>` |
//! | dump | `<channel id>/<file id>-<name>` |
//! | avatar | `__avatars/<user id>/<image name>` |
//!
//! Conversion always writes with the layout the target format mandates,
//! whatever layout the source used.

use std::fmt;

use crate::models::{Channel, File, User, MODE_EXTERNAL, MODE_HIDDEN_BY_LIMIT, MODE_TOMBSTONE};

pub const UPLOADS_DIR: &str = "__uploads";
pub const AVATARS_DIR: &str = "__avatars";
pub const ATTACHMENTS_DIR: &str = "attachments";

const UNNAMED: &str = "unnamed_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileLayout {
    Mattermost,
    Standard,
    Dump,
}

impl FileLayout {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mattermost" => Some(FileLayout::Mattermost),
            "standard" => Some(FileLayout::Standard),
            "dump" => Some(FileLayout::Dump),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileLayout::Mattermost => "mattermost",
            FileLayout::Standard => "standard",
            FileLayout::Dump => "dump",
        }
    }

    pub fn file_path(&self, channel: &Channel, file: &File) -> String {
        match self {
            FileLayout::Mattermost => mattermost_path(file),
            FileLayout::Standard => standard_path(channel, file),
            FileLayout::Dump => dump_path(&channel.id, file),
        }
    }
}

impl fmt::Display for FileLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn mattermost_path(file: &File) -> String {
    format!("{}/{}/{}", UPLOADS_DIR, file.id, sanitize_filename(&file.name))
}

pub fn standard_path(channel: &Channel, file: &File) -> String {
    format!(
        "{}/{}/{}-{}",
        channel.export_name(),
        ATTACHMENTS_DIR,
        file.id,
        sanitize_filename(&file.name)
    )
}

pub fn dump_path(channel_id: &str, file: &File) -> String {
    format!("{}/{}-{}", channel_id, file.id, sanitize_filename(&file.name))
}

/// `__avatars/<user id>/<basename of image_original>`, or `None` when the
/// user has no original image.
pub fn avatar_path(user: &User) -> Option<String> {
    let url = user.profile.image_original.as_str();
    if url.is_empty() {
        return None;
    }
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let base = without_query.rsplit('/').next().unwrap_or(without_query);
    Some(format!("{}/{}/{}", AVATARS_DIR, user.id, sanitize_filename(base)))
}

/// Make a file name safe on every common filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_end_matches([' ', '.']);
    if trimmed.is_empty() {
        return UNNAMED.to_string();
    }
    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if is_reserved(stem) {
        format!("_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn is_reserved(stem: &str) -> bool {
    let upper = stem.to_ascii_uppercase();
    if matches!(upper.as_str(), "CON" | "PRN" | "AUX" | "NUL") {
        return true;
    }
    match upper.strip_prefix("COM").or_else(|| upper.strip_prefix("LPT")) {
        Some(n) => n.len() == 1 && matches!(n.as_bytes()[0], b'1'..=b'9'),
        None => false,
    }
}

/// Why a file cannot be copied, or `None` when it has a body.
pub fn invalid_reason(file: &File) -> Option<&'static str> {
    match file.mode.as_str() {
        MODE_HIDDEN_BY_LIMIT => return Some("hidden by plan limit"),
        MODE_EXTERNAL => return Some("externally hosted"),
        MODE_TOMBSTONE => return Some("deleted (tombstone)"),
        _ => {}
    }
    if file.id.is_empty() {
        return Some("missing file id");
    }
    if !file.is_external && file.name.is_empty() {
        return Some("missing file name");
    }
    None
}

pub fn is_valid_file(file: &File) -> bool {
    invalid_reason(file).is_none()
}
