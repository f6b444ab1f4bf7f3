//! Resuming an archive: turn what is already stored into the entity list
//! of the next run.
//!
//! ```text
//! store ──latest()──► { unit → newest ts } ──► EntityList
//!                                              C1,  oldest = ts + 1µs
//!                                              C1:ts, ...
//! ```
//!
//! The lower bound is inclusive, so it is placed one microsecond past the
//! newest recorded message. A rerun with no new remote data therefore
//! writes nothing.

use anyhow::{Context, Result};
use chatvault_core::entity::{EntityItem, EntityList};
use chatvault_core::source::{LatestMap, Sourcer};
use chatvault_core::ts;
use chatvault_core::unit::SlackLink;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::stream::Streamer;

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("workspace mismatch: the archive holds team {stored}, the token belongs to team {live}")]
    WorkspaceMismatch { stored: String, live: String },
}

#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Carry thread units over into the next run.
    pub include_threads: bool,
    /// Also pick up channels created since the last run.
    pub refresh: bool,
    /// Upper bound of the resumed run.
    pub latest: Option<DateTime<Utc>>,
}

/// Newest recorded timestamp per unit, optionally without thread units.
pub async fn latest_map(source: &dyn Sourcer, include_threads: bool) -> Result<LatestMap> {
    let mut map = source
        .latest()
        .await
        .with_context(|| format!("read latest timestamps from {}", source.name()))?;
    if !include_threads {
        map.retain(|link, _| !link.is_thread());
    }
    Ok(map)
}

/// One include per unit, bounded below just past its newest message.
pub fn entity_list(latest: &LatestMap, upper: Option<DateTime<Utc>>) -> Result<EntityList> {
    let mut list = EntityList::new();
    for (link, last) in latest {
        let micros = ts::to_micros(last).with_context(|| format!("checkpoint of {}", link))?;
        let oldest = ts::to_datetime(&ts::from_micros(micros + 1))?;
        list.push(EntityItem {
            id: link.to_string(),
            oldest: Some(oldest),
            latest: upper,
            include: true,
        });
    }
    Ok(list)
}

/// Refuse to resume into an archive of another workspace. An archive
/// without a recorded identity is accepted with a warning.
pub async fn check_workspace(source: &dyn Sourcer, streamer: &dyn Streamer) -> Result<()> {
    let stored = match source.workspace_info().await {
        Ok(info) => info,
        Err(e) if e.is_not_found() || e.is_not_supported() => {
            warn!(source = source.name(), "archive has no workspace identity, not verified");
            return Ok(());
        }
        Err(e) => return Err(e).context("read archived workspace identity"),
    };
    let live = streamer
        .workspace_info()
        .await
        .context("query live workspace identity")?;
    if stored.team_id.is_empty() {
        warn!(source = source.name(), "archived workspace has no team id, not verified");
        return Ok(());
    }
    if stored.team_id != live.team_id {
        return Err(ResumeError::WorkspaceMismatch {
            stored: stored.team_id,
            live: live.team_id,
        }
        .into());
    }
    debug!(team_id = %live.team_id, "workspace identity verified");
    Ok(())
}

/// Build the entity list of a resumed run against `source`.
pub async fn plan(
    source: &dyn Sourcer,
    streamer: &dyn Streamer,
    opts: &ResumeOptions,
) -> Result<EntityList> {
    check_workspace(source, streamer).await?;
    let latest = latest_map(source, opts.include_threads).await?;
    let mut list = entity_list(&latest, opts.latest)?;

    if opts.refresh {
        let known: Vec<&str> = latest.keys().map(|l| l.channel.as_str()).collect();
        let mut added = 0usize;
        let mut cursor: Option<String> = None;
        loop {
            let page = streamer.list_channels(cursor.as_deref()).await?;
            let last = page.is_last();
            for c in page.items {
                if known.contains(&c.id.as_str()) || list.get(&c.id).is_some() {
                    continue;
                }
                let link = SlackLink {
                    channel: c.id,
                    thread_ts: String::new(),
                };
                list.push(EntityItem {
                    latest: opts.latest,
                    ..EntityItem::include(link.to_string())
                });
                added += 1;
            }
            if last {
                break;
            }
            cursor = page.next_cursor;
        }
        info!(added, "new channels since last run");
    }
    info!(units = list.include_count(), "resume plan");
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_is_one_micro_past_last() {
        let mut map = LatestMap::new();
        map.insert(SlackLink::parse("C1").unwrap(), "1700000000.000100".into());
        let list = entity_list(&map, None).unwrap();
        let item = list.get("C1").unwrap();
        assert!(item.include);
        assert_eq!(
            ts::from_datetime(&item.oldest.unwrap()),
            "1700000000.000101"
        );
        assert!(item.latest.is_none());
    }

    #[test]
    fn thread_units_keep_their_link() {
        let mut map = LatestMap::new();
        map.insert(
            SlackLink::parse("C1:1700000000.000100").unwrap(),
            "1700000050.000000".into(),
        );
        let list = entity_list(&map, None).unwrap();
        assert!(list.get("C1:1700000000.000100").is_some());
    }
}
