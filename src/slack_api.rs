//! HTTP client for the Slack Web API.
//!
//! Implements [`Streamer`] and [`Fetcher`] on top of `reqwest`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 → wait for `Retry-After` seconds (or the backoff delay when
//!   the header is missing), then retry
//! - HTTP 5xx and network errors → retry with exponential backoff
//!   (`backoff_ms`, doubled per attempt)
//! - any other non-success status, or `"ok": false` → fail immediately
//!
//! After `max_retries` retries the last error is returned.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chatvault_core::models::{Channel, File, Message, SearchMessage, User, WorkspaceInfo};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::stream::{Fetcher, Page, Streamer, Window};

const CONVERSATION_TYPES: &str = "public_channel,private_channel,mpim,im";

pub struct SlackClient {
    http: Client,
    base_url: String,
    token: String,
    max_retries: u32,
    backoff: Duration,
    page_limit: u32,
}

impl SlackClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let token = config.resolve_token()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            page_limit: config.page_limit,
        })
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1).min(6))
    }

    /// GET with retry. Returns the raw response body on success.
    async fn get_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>> {
        let mut last_err = None;
        let mut wait = Duration::ZERO;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = wait.max(self.delay(attempt));
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }
            wait = Duration::ZERO;

            let resp = self
                .http
                .get(url)
                .header(AUTHORIZATION, format!("Bearer {}", self.token))
                .query(query)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.bytes().await?.to_vec());
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        wait = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.trim().parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or_default();
                        warn!(url, retry_after_s = wait.as_secs(), "rate limited");
                        last_err = Some(anyhow::anyhow!("rate limited: {}", url));
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("server error {}: {}", status, url));
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    bail!("request failed {}: {}: {}", status, url, body);
                }
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context(format!("GET {}", url)));
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed after retries: {}", url)))
    }

    /// Call a Web API method and return its JSON body after checking `ok`.
    async fn call(&self, method: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, method);
        let body = self.get_with_retry(&url, query).await?;
        let v: Value = serde_json::from_slice(&body)
            .with_context(|| format!("decode {} response", method))?;
        if v.get("ok").and_then(Value::as_bool) != Some(true) {
            let err = v.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            bail!("{}: {}", method, err);
        }
        Ok(v)
    }

    fn cursor_query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut q = vec![("limit", self.page_limit.to_string())];
        if let Some(c) = cursor.filter(|c| !c.is_empty()) {
            q.push(("cursor", c.to_string()));
        }
        q
    }
}

fn field<T: DeserializeOwned>(v: &Value, name: &str) -> Result<T> {
    let raw = v
        .get(name)
        .cloned()
        .with_context(|| format!("response has no {:?} field", name))?;
    serde_json::from_value(raw).with_context(|| format!("decode {:?}", name))
}

fn next_cursor(v: &Value) -> Option<String> {
    v.pointer("/response_metadata/next_cursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn window_query(q: &mut Vec<(&'static str, String)>, window: &Window) {
    if let Some(o) = &window.oldest {
        q.push(("oldest", o.clone()));
    }
    if let Some(l) = &window.latest {
        q.push(("latest", l.clone()));
    }
    q.push(("inclusive", window.inclusive.to_string()));
}

/// Search endpoints paginate by page number; the cursor carries it.
fn search_page<T: DeserializeOwned>(v: &Value, key: &str) -> Result<Page<T>> {
    let section = v
        .get(key)
        .with_context(|| format!("search response has no {:?}", key))?;
    let items: Vec<T> = field(section, "matches")?;
    let page = section.pointer("/paging/page").and_then(Value::as_u64).unwrap_or(1);
    let pages = section.pointer("/paging/pages").and_then(Value::as_u64).unwrap_or(1);
    Ok(Page {
        items,
        next_cursor: (page < pages).then(|| (page + 1).to_string()),
    })
}

#[async_trait]
impl Streamer for SlackClient {
    async fn workspace_info(&self) -> Result<WorkspaceInfo> {
        let v = self.call("auth.test", &[]).await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn list_channels(&self, cursor: Option<&str>) -> Result<Page<Channel>> {
        let mut q = self.cursor_query(cursor);
        q.push(("types", CONVERSATION_TYPES.to_string()));
        let v = self.call("conversations.list", &q).await?;
        Ok(Page {
            items: field(&v, "channels")?,
            next_cursor: next_cursor(&v),
        })
    }

    async fn list_users(&self, cursor: Option<&str>) -> Result<Page<User>> {
        let v = self.call("users.list", &self.cursor_query(cursor)).await?;
        Ok(Page {
            items: field(&v, "members")?,
            next_cursor: next_cursor(&v),
        })
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Channel> {
        let v = self
            .call("conversations.info", &[("channel", channel_id.to_string())])
            .await?;
        field(&v, "channel")
    }

    async fn channel_members(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>> {
        let mut q = self.cursor_query(cursor);
        q.push(("channel", channel_id.to_string()));
        let v = self.call("conversations.members", &q).await?;
        Ok(Page {
            items: field(&v, "members")?,
            next_cursor: next_cursor(&v),
        })
    }

    async fn history(
        &self,
        channel_id: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        let mut q = self.cursor_query(cursor);
        q.push(("channel", channel_id.to_string()));
        window_query(&mut q, window);
        let v = self.call("conversations.history", &q).await?;
        Ok(Page {
            items: field(&v, "messages")?,
            next_cursor: next_cursor(&v),
        })
    }

    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        window: &Window,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        let mut q = self.cursor_query(cursor);
        q.push(("channel", channel_id.to_string()));
        q.push(("ts", thread_ts.to_string()));
        window_query(&mut q, window);
        let v = self.call("conversations.replies", &q).await?;
        Ok(Page {
            items: field(&v, "messages")?,
            next_cursor: next_cursor(&v),
        })
    }

    async fn search_messages(
        &self,
        query: &str,
        cursor: Option<&str>,
    ) -> Result<Page<SearchMessage>> {
        let q = vec![
            ("query", query.to_string()),
            ("count", self.page_limit.min(100).to_string()),
            ("page", cursor.unwrap_or("1").to_string()),
        ];
        let v = self.call("search.messages", &q).await?;
        search_page(&v, "messages")
    }

    async fn search_files(&self, query: &str, cursor: Option<&str>) -> Result<Page<File>> {
        let q = vec![
            ("query", query.to_string()),
            ("count", self.page_limit.min(100).to_string()),
            ("page", cursor.unwrap_or("1").to_string()),
        ];
        let v = self.call("search.files", &q).await?;
        search_page(&v, "files")
    }
}

#[async_trait]
impl Fetcher for SlackClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.get_with_retry(url, &[]).await
    }
}
