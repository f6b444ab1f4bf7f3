//! Entity lists: the set of logical units a run is scoped to.
//!
//! Entries are written as links with optional time bounds:
//!
//! ```text
//! C123                                   include a channel
//! ^C456                                  exclude a channel
//! C123:1700000000.000100                 include a single thread
//! C123,2024-01-01T00:00:00,2024-02-01    include with oldest/latest bounds
//! ```

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::unit::SlackLink;

const EXCLUDE_PREFIX: char = '^';
const TIME_SEPARATOR: char = ',';
const TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_LAYOUT: &str = "%Y-%m-%d";

/// Upper bound on entries accepted from a single list.
pub const MAX_ENTRIES: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityItem {
    /// Link in `C123` or `C123:thread_ts` notation.
    pub id: String,
    /// Inclusive lower time bound. Resumed runs set it one microsecond
    /// past the last recorded message.
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub include: bool,
}

impl EntityItem {
    pub fn include(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            oldest: None,
            latest: None,
            include: true,
        }
    }

    pub fn exclude(id: impl Into<String>) -> Self {
        Self {
            include: false,
            ..Self::include(id)
        }
    }

    pub fn link(&self) -> Result<SlackLink> {
        SlackLink::parse(&self.id)
    }
}

/// Ordered, de-duplicated set of [`EntityItem`]s. A later entry for the
/// same id replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityList {
    items: Vec<EntityItem>,
}

impl EntityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = EntityItem>) -> Self {
        let mut list = Self::new();
        for item in items {
            list.push(item);
        }
        list
    }

    /// Parse textual entries. Blank lines and `#` comments are ignored.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut list = Self::new();
        for raw in entries {
            let raw = raw.as_ref().trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            if list.items.len() >= MAX_ENTRIES {
                bail!("entity list exceeds {} entries", MAX_ENTRIES);
            }
            list.push(parse_entry(raw)?);
        }
        Ok(list)
    }

    /// Parse a whitespace or newline separated list.
    pub fn parse_str(s: &str) -> Result<Self> {
        let entries: Vec<&str> = s
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .flat_map(str::split_whitespace)
            .collect();
        Self::parse(&entries)
    }

    pub fn push(&mut self, item: EntityItem) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn items(&self) -> &[EntityItem] {
        &self.items
    }

    pub fn includes(&self) -> impl Iterator<Item = &EntityItem> {
        self.items.iter().filter(|i| i.include)
    }

    pub fn include_count(&self) -> usize {
        self.includes().count()
    }

    pub fn exclude_count(&self) -> usize {
        self.items.len() - self.include_count()
    }

    pub fn has_includes(&self) -> bool {
        self.items.iter().any(|i| i.include)
    }

    pub fn has_excludes(&self) -> bool {
        self.items.iter().any(|i| !i.include)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.items.iter().any(|i| i.id == id && !i.include)
    }

    pub fn is_included(&self, id: &str) -> bool {
        self.items.iter().any(|i| i.id == id && i.include)
    }

    pub fn get(&self, id: &str) -> Option<&EntityItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn index(&self) -> HashMap<&str, &EntityItem> {
        self.items.iter().map(|i| (i.id.as_str(), i)).collect()
    }
}

fn parse_entry(raw: &str) -> Result<EntityItem> {
    let mut parts = raw.splitn(3, TIME_SEPARATOR);
    let head = parts.next().unwrap_or_default().trim();
    let (include, link) = match head.strip_prefix(EXCLUDE_PREFIX) {
        Some(rest) => (false, rest),
        None => (true, head),
    };
    let link = SlackLink::parse(link).with_context(|| format!("invalid entry {:?}", raw))?;
    let oldest = parts.next().map(parse_time).transpose()?.flatten();
    let latest = parts.next().map(parse_time).transpose()?.flatten();
    if let (Some(o), Some(l)) = (oldest, latest) {
        if o > l {
            bail!("entry {:?}: oldest is after latest", raw);
        }
    }
    Ok(EntityItem {
        id: link.to_string(),
        oldest,
        latest,
        include,
    })
}

/// Accepts `2006-01-02T15:04:05` or `2006-01-02`; empty means unbounded.
pub fn parse_time(s: &str) -> Result<Option<DateTime<Utc>>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, TIME_LAYOUT) {
        return Ok(Some(dt.and_utc()));
    }
    let date = NaiveDate::parse_from_str(s, DATE_LAYOUT)
        .with_context(|| format!("invalid time {:?}, want YYYY-MM-DD[THH:MM:SS]", s))?;
    Ok(date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_and_excludes() {
        let list = EntityList::parse(&["C1", "^C2", "C3:1700000000.000100", "", "# note"]).unwrap();
        assert_eq!(list.include_count(), 2);
        assert_eq!(list.exclude_count(), 1);
        assert!(list.is_excluded("C2"));
        assert!(list.is_included("C3:1700000000.000100"));
        assert!(!list.is_included("C2"));
    }

    #[test]
    fn time_bounds() {
        let list = EntityList::parse(&["C1,2024-01-01T10:00:00,2024-02-01"]).unwrap();
        let item = list.get("C1").unwrap();
        assert_eq!(
            item.oldest.unwrap().to_rfc3339(),
            "2024-01-01T10:00:00+00:00"
        );
        assert_eq!(item.latest.unwrap().to_rfc3339(), "2024-02-01T00:00:00+00:00");
        assert!(EntityList::parse(&["C1,2024-02-01,2024-01-01"]).is_err());
        assert!(EntityList::parse(&["C1,yesterday"]).is_err());
    }

    #[test]
    fn later_entry_wins() {
        let list = EntityList::parse(&["C1", "^C1"]).unwrap();
        assert_eq!(list.items().len(), 1);
        assert!(list.is_excluded("C1"));
    }

    #[test]
    fn parse_from_text_block() {
        let list = EntityList::parse_str("C1 C2\n# skip\n^C3\n").unwrap();
        assert_eq!(list.items().len(), 3);
    }
}
