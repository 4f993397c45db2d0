use crate::whitelist::normalize_host;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Source of the hosts that are open in the browser right now.
pub trait TabSource: Send + Sync {
    fn open_hosts(&self) -> anyhow::Result<Vec<String>>;
}

struct TabSnapshot {
    hosts: Vec<String>,
    received_at: Instant,
}

/// Latest open-tabs snapshot posted by the extension.
///
/// A snapshot older than `freshness` counts as "nothing open", so a browser
/// that went away without saying so stops accruing time.
pub struct OpenTabs {
    freshness: Duration,
    snapshot: Mutex<Option<TabSnapshot>>,
}

impl OpenTabs {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness,
            snapshot: Mutex::new(None),
        }
    }

    /// Replaces the snapshot. URLs without a usable host are skipped.
    /// Returns the number of distinct hosts kept.
    pub fn update<I, S>(&self, urls: I) -> anyhow::Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts: Vec<String> = urls
            .into_iter()
            .filter_map(|u| normalize_host(u.as_ref()))
            .collect();
        hosts.sort();
        hosts.dedup();
        let n = hosts.len();

        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("open_tabs_lock_poisoned"))?;
        *guard = Some(TabSnapshot {
            hosts,
            received_at: Instant::now(),
        });
        Ok(n)
    }
}

impl TabSource for OpenTabs {
    fn open_hosts(&self) -> anyhow::Result<Vec<String>> {
        let guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("open_tabs_lock_poisoned"))?;
        match guard.as_ref() {
            Some(s) if s.received_at.elapsed() <= self.freshness => Ok(s.hosts.clone()),
            _ => Ok(Vec::new()),
        }
    }
}
