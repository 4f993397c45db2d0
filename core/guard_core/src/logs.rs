//! Login attempts and batched browsing history.

use crate::db::{self, Db};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Pages under this scheme belong to the browser itself and are never logged.
const INTERNAL_URL_PREFIX: &str = "resource";

#[derive(Clone, Debug)]
pub struct LoginAttempt {
    pub id: i64,
    pub ts: String,
    pub success: bool,
}

impl LoginAttempt {
    /// `2026-10-19 14:03:11 : success`
    pub fn line(&self) -> String {
        let outcome = if self.success { "success" } else { "fail" };
        format!("{} : {}", self.ts, outcome)
    }
}

pub fn login_timestamp(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub title: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    Ignored,
    Buffered,
    OverQuota,
}

/// In-memory buffer of visits waiting to be written.
#[derive(Debug)]
pub struct HistoryBuffer {
    logging: bool,
    quota: usize,
    pending: Vec<Visit>,
}

impl HistoryBuffer {
    pub fn new(quota: usize, logging: bool) -> Self {
        Self {
            logging,
            quota: quota.max(1),
            pending: Vec::new(),
        }
    }

    pub fn is_logging(&self) -> bool {
        self.logging
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn record(&mut self, visit: Visit) -> Recorded {
        if !self.logging || visit.url.starts_with(INTERNAL_URL_PREFIX) {
            return Recorded::Ignored;
        }
        self.pending.push(visit);
        if self.pending.len() >= self.quota {
            Recorded::OverQuota
        } else {
            Recorded::Buffered
        }
    }

    pub fn take_pending(&mut self) -> Vec<Visit> {
        std::mem::take(&mut self.pending)
    }

    /// Puts a batch that failed to persist back ahead of anything newer.
    pub fn restore(&mut self, mut batch: Vec<Visit>) {
        batch.append(&mut self.pending);
        self.pending = batch;
    }
}

#[derive(Clone)]
pub struct HistoryLog {
    buffer: Arc<Mutex<HistoryBuffer>>,
    db: Db,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryStatus {
    pub logging: bool,
    pub pending: usize,
}

impl HistoryLog {
    pub async fn load(db: Db, quota: usize) -> rusqlite::Result<Self> {
        let logging = {
            let mut conn = db.lock().await;
            db::load_tracking_flags(&mut conn)?.history_logging
        };
        Ok(Self {
            buffer: Arc::new(Mutex::new(HistoryBuffer::new(quota, logging))),
            db,
        })
    }

    pub async fn status(&self) -> HistoryStatus {
        let buf = self.buffer.lock().await;
        HistoryStatus {
            logging: buf.is_logging(),
            pending: buf.pending_len(),
        }
    }

    pub async fn start(&self) -> rusqlite::Result<HistoryStatus> {
        let mut buf = self.buffer.lock().await;
        if !buf.logging {
            let mut conn = self.db.lock().await;
            db::set_history_logging(&mut conn, true, &db::now_rfc3339())?;
            buf.logging = true;
            info!("history logging started");
        }
        Ok(HistoryStatus {
            logging: true,
            pending: buf.pending_len(),
        })
    }

    pub async fn stop(&self) -> rusqlite::Result<HistoryStatus> {
        let mut buf = self.buffer.lock().await;
        if buf.logging {
            let mut conn = self.db.lock().await;
            db::set_history_logging(&mut conn, false, &db::now_rfc3339())?;
            buf.logging = false;
            info!("history logging stopped");
        }
        Self::flush_locked(&mut buf, &self.db).await?;
        Ok(HistoryStatus {
            logging: false,
            pending: buf.pending_len(),
        })
    }

    /// Buffers a page load. Over quota, the buffer is written out at once.
    pub async fn record(&self, visit: Visit) -> rusqlite::Result<Recorded> {
        let mut buf = self.buffer.lock().await;
        let recorded = buf.record(visit);
        if recorded == Recorded::OverQuota {
            info!("history buffer over quota; flushing");
            Self::flush_locked(&mut buf, &self.db).await?;
        }
        Ok(recorded)
    }

    pub async fn flush(&self) -> rusqlite::Result<usize> {
        let mut buf = self.buffer.lock().await;
        Self::flush_locked(&mut buf, &self.db).await
    }

    /// Flushes pending visits, then reads the full log back.
    pub async fn read(&self) -> rusqlite::Result<Vec<Visit>> {
        let mut buf = self.buffer.lock().await;
        Self::flush_locked(&mut buf, &self.db).await?;
        let mut conn = self.db.lock().await;
        db::list_visits(&mut conn)
    }

    pub async fn clear(&self) -> rusqlite::Result<Vec<Visit>> {
        let mut buf = self.buffer.lock().await;
        let dropped = buf.take_pending().len();
        let mut conn = self.db.lock().await;
        let removed = db::clear_history(&mut conn)?;
        info!(removed, dropped, "history cleared");
        db::list_visits(&mut conn)
    }

    async fn flush_locked(buf: &mut HistoryBuffer, db: &Db) -> rusqlite::Result<usize> {
        let batch = buf.take_pending();
        if batch.is_empty() {
            return Ok(0);
        }
        let n = batch.len();
        let mut conn = db.lock().await;
        match db::insert_visits(&mut conn, &batch) {
            Ok(()) => Ok(n),
            Err(err) => {
                error!("insert_visits failed ({n} visits kept): {err}");
                buf.restore(batch);
                Err(err)
            }
        }
    }
}
