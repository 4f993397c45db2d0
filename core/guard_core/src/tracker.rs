//! Per-category time accounting.
//!
//! Once per [`TICK_PERIOD`] the ticker samples which whitelist categories have
//! an open tab and adds one second to each of them. The report is reconciled
//! against the whitelist on start and on every query: categories that were
//! removed lose their accumulated time, new ones start at zero.

use crate::db::{self, Db};
use crate::tabs::TabSource;
use crate::whitelist::Whitelist;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One tick adds exactly one second, so the period is fixed.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTime {
    /// Seconds.
    pub duration: u64,
}

/// Category -> accumulated seconds, serialized as `{"news": {"duration": 5}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeReport {
    entries: BTreeMap<String, CategoryTime>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TimeReport {
    pub fn from_durations<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(c, duration)| (c, CategoryTime { duration }))
                .collect(),
        }
    }

    pub fn duration(&self, category: &str) -> Option<u64> {
        self.entries.get(category).map(|t| t.duration)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.entries.iter().map(|(c, t)| (c.as_str(), t.duration))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Makes the key set equal `known`. Durations of categories that stay are
    /// untouched; dropped categories lose their history.
    pub fn reconcile(&mut self, known: &BTreeSet<String>) -> Reconciled {
        let mut out = Reconciled::default();
        self.entries.retain(|category, _| {
            let keep = known.contains(category);
            if !keep {
                out.removed.push(category.clone());
            }
            keep
        });
        for category in known {
            if !self.entries.contains_key(category) {
                self.entries.insert(category.clone(), CategoryTime::default());
                out.added.push(category.clone());
            }
        }
        out
    }

    /// Adds one second to every open category already in the report.
    /// Returns the categories that were bumped.
    pub fn tick(&mut self, open: &BTreeSet<String>) -> Vec<String> {
        let mut bumped = Vec::new();
        for category in open {
            if let Some(t) = self.entries.get_mut(category) {
                t.duration = t.duration.saturating_add(1);
                bumped.push(category.clone());
            }
        }
        bumped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cancellable handle to the repeating tick task.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct TrackerState {
    report: TimeReport,
    // Snapshot taken at the last reconcile; ticks map hosts through it.
    whitelist: Whitelist,
    timer: Option<TimerHandle>,
}

/// Owner of the time report and the ticker.
///
/// Lock order: tracker state first, database second.
#[derive(Clone)]
pub struct TimeTracker {
    state: Arc<Mutex<TrackerState>>,
    db: Db,
    tabs: Arc<dyn TabSource>,
}

impl TimeTracker {
    pub async fn load(db: Db, tabs: Arc<dyn TabSource>) -> rusqlite::Result<Self> {
        let report = {
            let mut conn = db.lock().await;
            db::load_time_report(&mut conn)?
        };
        Ok(Self {
            state: Arc::new(Mutex::new(TrackerState {
                report,
                ..TrackerState::default()
            })),
            db,
            tabs,
        })
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.timer.is_some()
    }

    /// Reconciles against the whitelist and (re)starts the ticker.
    /// An already running ticker is replaced, never doubled.
    pub async fn start(&self) -> rusqlite::Result<()> {
        let mut state = self.state.lock().await;
        {
            let mut conn = self.db.lock().await;
            reconcile_locked(&mut state, &mut conn)?;
            db::set_time_tracking(&mut conn, true, &db::now_rfc3339())?;
        }

        if let Some(prev) = state.timer.take() {
            debug!("replacing running time ticker");
            prev.cancel();
        }
        state.timer = Some(spawn_ticker(
            Arc::downgrade(&self.state),
            self.db.clone(),
            self.tabs.clone(),
        ));
        info!(categories = state.report.len(), "time tracking started");
        Ok(())
    }

    /// Cancels the ticker. Returns `false` (and changes nothing) when it was
    /// not running.
    pub async fn stop(&self) -> rusqlite::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(handle) = state.timer.take() else {
            return Ok(false);
        };
        handle.cancel();

        let mut conn = self.db.lock().await;
        db::set_time_tracking(&mut conn, false, &db::now_rfc3339())?;
        info!("time tracking stopped");
        Ok(true)
    }

    /// Reconciles, persists and returns a copy of the report.
    pub async fn query(&self) -> rusqlite::Result<TimeReport> {
        let mut state = self.state.lock().await;
        let mut conn = self.db.lock().await;
        reconcile_locked(&mut state, &mut conn)?;
        Ok(state.report.clone())
    }

    /// Empties the report. The next query rebuilds it at zero.
    pub async fn clear(&self) -> rusqlite::Result<()> {
        let mut state = self.state.lock().await;
        state.report.clear();
        let mut conn = self.db.lock().await;
        db::clear_time_report(&mut conn)?;
        info!("time report cleared");
        Ok(())
    }

    /// Stops the ticker and writes the report, leaving the persisted
    /// tracking flag alone so the next process resumes.
    pub async fn suspend(&self) -> rusqlite::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.timer.take() {
            handle.cancel();
        }
        let mut conn = self.db.lock().await;
        db::save_time_report(&mut conn, &state.report)
    }
}

fn reconcile_locked(
    state: &mut TrackerState,
    conn: &mut rusqlite::Connection,
) -> rusqlite::Result<()> {
    let whitelist = db::load_whitelist(conn)?;
    let changes = state.report.reconcile(&whitelist.known());
    if !changes.removed.is_empty() {
        info!(removed = ?changes.removed, "dropped time for categories no longer whitelisted");
    }
    if !changes.added.is_empty() {
        debug!(added = ?changes.added, "new categories in time report");
    }
    db::save_time_report(conn, &state.report)?;
    state.whitelist = whitelist;
    Ok(())
}

fn spawn_ticker(
    state: Weak<Mutex<TrackerState>>,
    db: Db,
    tabs: Arc<dyn TabSource>,
) -> TimerHandle {
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
        // Seconds the process did not observe are not counted.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            tick_once(&state, &db, tabs.as_ref()).await;
        }
    });
    TimerHandle { task }
}

async fn tick_once(state: &Mutex<TrackerState>, db: &Db, tabs: &dyn TabSource) {
    let hosts = match tabs.open_hosts() {
        Ok(v) => v,
        Err(err) => {
            warn!("open tab sample failed: {err}");
            Vec::new()
        }
    };

    let mut state = state.lock().await;
    let open = state.whitelist.open_categories(&hosts);
    let bumped = state.report.tick(&open);
    if bumped.is_empty() {
        return;
    }
    debug!(?bumped, "tick");

    let mut conn = db.lock().await;
    if let Err(err) = db::save_durations(&mut conn, &state.report, &bumped) {
        error!("save_durations failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn set(v: &[&str]) -> BTreeSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Hosts reported by a test; `None` makes the sample fail.
    struct FakeTabs(StdMutex<Option<Vec<String>>>);

    impl FakeTabs {
        fn new(hosts: &[&str]) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Some(
                hosts.iter().map(|s| s.to_string()).collect(),
            ))))
        }

        fn set(&self, hosts: Option<&[&str]>) {
            *self.0.lock().unwrap() = hosts.map(|h| h.iter().map(|s| s.to_string()).collect());
        }
    }

    impl TabSource for FakeTabs {
        fn open_hosts(&self) -> anyhow::Result<Vec<String>> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("sample_failed"))
        }
    }

    async fn setup(tabs: Arc<FakeTabs>) -> (Db, TimeTracker) {
        let db: Db = Arc::new(Mutex::new(db::open_memory()));
        {
            let mut conn = db.lock().await;
            let ts = "2026-10-19T00:00:00Z";
            db::insert_whitelist_category(&mut conn, "news", ts).unwrap();
            db::insert_whitelist_host(&mut conn, "news", "bbc.com", ts).unwrap();
            db::insert_whitelist_category(&mut conn, "games", ts).unwrap();
            db::insert_whitelist_host(&mut conn, "games", "chess.com", ts).unwrap();
        }
        let tracker = TimeTracker::load(db.clone(), tabs).await.unwrap();
        (db, tracker)
    }

    #[test]
    fn reconcile_matches_known_exactly() {
        let mut r = TimeReport::from_durations([
            ("news".to_string(), 7),
            ("stale".to_string(), 3),
        ]);
        let changes = r.reconcile(&set(&["news", "games"]));
        assert_eq!(r.iter().map(|(c, _)| c).collect::<Vec<_>>(), vec!["games", "news"]);
        assert_eq!(r.duration("news"), Some(7));
        assert_eq!(r.duration("games"), Some(0));
        assert_eq!(changes.removed, vec!["stale".to_string()]);
        assert_eq!(changes.added, vec!["games".to_string()]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let known = set(&["a", "b"]);
        let mut once = TimeReport::from_durations([("a".to_string(), 4), ("z".to_string(), 1)]);
        once.reconcile(&known);
        let mut twice = once.clone();
        let changes = twice.reconcile(&known);
        assert_eq!(once, twice);
        assert_eq!(changes, Reconciled::default());
    }

    #[test]
    fn two_ticks_add_two_to_open_known_only() {
        let start = TimeReport::from_durations([
            ("news".to_string(), 10),
            ("games".to_string(), 3),
            ("video".to_string(), 0),
        ]);
        let open = set(&["news", "video", "unknown"]);
        let mut r = start.clone();
        r.tick(&open);
        r.tick(&open);
        assert_eq!(r.duration("news"), Some(12));
        assert_eq!(r.duration("video"), Some(2));
        assert_eq!(r.duration("games"), Some(3));
        assert_eq!(r.duration("unknown"), None);
        assert_eq!(r.len(), start.len());
    }

    #[test]
    fn tick_with_stale_category_is_a_noop() {
        let mut r = TimeReport::from_durations([("news".to_string(), 1)]);
        let before = r.clone();
        assert!(r.tick(&set(&["removed"])).is_empty());
        assert_eq!(r, before);
    }

    #[test]
    fn clear_then_reconcile_zeroes_everything() {
        let mut r = TimeReport::from_durations([("news".to_string(), 99), ("x".to_string(), 5)]);
        r.clear();
        assert_eq!(r.len(), 0);
        r.reconcile(&set(&["news", "games"]));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![("games", 0), ("news", 0)]);
    }

    #[test]
    fn removed_category_comes_back_at_zero() {
        let mut r = TimeReport::default();
        r.reconcile(&set(&["news", "games"]));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![("games", 0), ("news", 0)]);

        for _ in 0..5 {
            r.tick(&set(&["news"]));
        }
        assert_eq!(r.duration("news"), Some(5));
        assert_eq!(r.duration("games"), Some(0));

        r.reconcile(&set(&["news"]));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![("news", 5)]);

        r.reconcile(&set(&["news", "games"]));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![("games", 0), ("news", 5)]);
    }

    #[test]
    fn report_serializes_with_duration_objects() {
        let r = TimeReport::from_durations([("news".to_string(), 5)]);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({"news": {"duration": 5}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_counts_open_categories_each_second() {
        let tabs = FakeTabs::new(&["www.bbc.com"]);
        let (db, tracker) = setup(tabs).await;
        tracker.start().await.unwrap();
        assert!(tracker.is_running().await);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        let report = tracker.query().await.unwrap();
        assert_eq!(report.duration("news"), Some(5));
        assert_eq!(report.duration("games"), Some(0));

        let mut conn = db.lock().await;
        assert_eq!(db::load_time_report(&mut conn).unwrap().duration("news"), Some(5));
        assert!(db::load_tracking_flags(&mut conn).unwrap().time_tracking);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_double_count() {
        let tabs = FakeTabs::new(&["bbc.com"]);
        let (_db, tracker) = setup(tabs).await;
        tracker.start().await.unwrap();
        tracker.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(tracker.query().await.unwrap().duration("news"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_counting() {
        let tabs = FakeTabs::new(&["chess.com"]);
        let (db, tracker) = setup(tabs).await;
        tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(tracker.stop().await.unwrap());
        assert!(!tracker.is_running().await);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(tracker.query().await.unwrap().duration("games"), Some(2));
        let mut conn = db.lock().await;
        assert!(!db::load_tracking_flags(&mut conn).unwrap().time_tracking);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_never_started_changes_nothing() {
        let tabs = FakeTabs::new(&[]);
        let (db, tracker) = setup(tabs).await;
        let before = {
            let mut conn = db.lock().await;
            db::load_tracking_flags(&mut conn).unwrap()
        };
        assert!(!tracker.stop().await.unwrap());
        assert!(!tracker.stop().await.unwrap());

        let mut conn = db.lock().await;
        assert_eq!(db::load_tracking_flags(&mut conn).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sample_counts_nothing_and_keeps_running() {
        let tabs = FakeTabs::new(&["bbc.com"]);
        let (_db, tracker) = setup(tabs.clone()).await;
        tracker.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tabs.set(None);
        tokio::time::sleep(Duration::from_secs(3)).await;
        tabs.set(Some(&["bbc.com"][..]));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(tracker.is_running().await);
        assert_eq!(tracker.query().await.unwrap().duration("news"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_and_query_rebuilds_at_zero() {
        let tabs = FakeTabs::new(&["bbc.com", "chess.com"]);
        let (_db, tracker) = setup(tabs).await;
        tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        tracker.clear().await.unwrap();
        let report = tracker.query().await.unwrap();
        assert_eq!(report.iter().collect::<Vec<_>>(), vec![("games", 0), ("news", 0)]);
        assert!(tracker.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn whitelist_changes_apply_on_query() {
        let tabs = FakeTabs::new(&["bbc.com"]);
        let (db, tracker) = setup(tabs).await;
        tracker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        {
            let mut conn = db.lock().await;
            db::delete_whitelist_category(&mut conn, "games").unwrap();
        }
        let report = tracker.query().await.unwrap();
        assert_eq!(report.iter().collect::<Vec<_>>(), vec![("news", 5)]);

        {
            let mut conn = db.lock().await;
            db::insert_whitelist_category(&mut conn, "games", "2026-10-19T00:00:00Z").unwrap();
        }
        let report = tracker.query().await.unwrap();
        assert_eq!(report.iter().collect::<Vec<_>>(), vec![("games", 0), ("news", 5)]);
    }

    #[tokio::test]
    async fn report_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.db");

        let open = || {
            let conn = rusqlite::Connection::open(&path).unwrap();
            db::init_db(&conn).unwrap();
            Arc::new(Mutex::new(conn)) as Db
        };

        let db = open();
        {
            let mut conn = db.lock().await;
            db::insert_whitelist_category(&mut conn, "news", "2026-10-19T00:00:00Z").unwrap();
        }
        let tracker = TimeTracker::load(db.clone(), FakeTabs::new(&[])).await.unwrap();
        {
            let mut state = tracker.state.lock().await;
            state.report = TimeReport::from_durations([("news".to_string(), 42)]);
        }
        tracker.suspend().await.unwrap();
        drop(tracker);
        drop(db);

        let tracker = TimeTracker::load(open(), FakeTabs::new(&[])).await.unwrap();
        assert_eq!(tracker.query().await.unwrap().duration("news"), Some(42));
    }
}
