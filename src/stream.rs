//! The remote side of ingestion.
//!
//! A [`Streamer`] serves paginated API data; a [`Fetcher`] downloads
//! attachment and avatar bodies. Both are traits so the controller can run
//! against the live HTTP client ([`crate::slack_api::SlackClient`]) or an
//! in-memory fake in tests.
//!
//! Pages are returned in the order the API produces them; the controller
//! writes them in that same order. Rate limiting and retries happen below
//! this interface.

use anyhow::Result;
use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};
use chatvault_core::ts;
use chrono::{DateTime, Utc};

/// One page of results plus the cursor of the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` on the last page.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.as_deref().map_or(true, str::is_empty)
    }
}

/// Time bounds of a history or replies request, as Slack timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    pub oldest: Option<String>,
    pub latest: Option<String>,
    /// Include messages exactly at the bounds.
    pub inclusive: bool,
}

impl Window {
    pub fn new(oldest: Option<DateTime<Utc>>, latest: Option<DateTime<Utc>>) -> Self {
        Self {
            oldest: oldest.map(|t| ts::from_datetime(&t)),
            latest: latest.map(|t| ts::from_datetime(&t)),
            inclusive: true,
        }
    }

    /// Whether a message timestamp falls inside the window.
    pub fn contains(&self, msg_ts: &str) -> bool {
        let t = ts::sort_key(msg_ts);
        let lower = self.oldest.as_deref().map(ts::sort_key);
        let upper = self.latest.as_deref().map(ts::sort_key);
        let above = match lower {
            None => true,
            Some(o) if self.inclusive => t >= o,
            Some(o) => t > o,
        };
        let below = match upper {
            None => true,
            Some(l) if self.inclusive => t <= l,
            Some(l) => t < l,
        };
        above && below
    }
}

#[async_trait]
pub trait Streamer: Send + Sync {
    async fn workspace_info(&self) -> Result<WorkspaceInfo>;

    async fn list_channels(&self, cursor: Option<&str>) -> Result<Page<Channel>>;

    async fn list_users(&self, cursor: Option<&str>) -> Result<Page<User>>;

    async fn channel_info(&self, channel_id: &str) -> Result<Channel>;

    async fn channel_members(&self, channel_id: &str, cursor: Option<&str>)
        -> Result<Page<String>>;

    /// One page of a channel's main timeline.
    async fn history(
        &self,
        channel_id: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>>;

    /// One page of a thread. The first page starts with the parent.
    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>>;

    async fn search_messages(&self, query: &str, cursor: Option<&str>)
        -> Result<Page<SearchMessage>>;

    async fn search_files(&self, query: &str, cursor: Option<&str>) -> Result<Page<File>>;
}

/// Downloads a private URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds() {
        let w = Window {
            oldest: Some("10.000000".into()),
            latest: None,
            inclusive: false,
        };
        assert!(!w.contains("10.000000"));
        assert!(w.contains("10.000001"));
        assert!(!w.contains("9.5"));

        let w = Window {
            oldest: Some("1.0".into()),
            latest: Some("2.0".into()),
            inclusive: true,
        };
        assert!(w.contains("1.0"));
        assert!(w.contains("2.0"));
        assert!(!w.contains("2.000001"));
        assert!(Window::default().contains("123.0"));
    }

    #[test]
    fn last_page() {
        assert!(Page::last(vec![1]).is_last());
        let p = Page {
            items: vec![1],
            next_cursor: Some(String::new()),
        };
        assert!(p.is_last());
    }
}
