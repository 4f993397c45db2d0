use crate::logs::{LoginAttempt, Visit};
use crate::tracker::TimeReport;
use crate::whitelist::Whitelist;
use rusqlite::Connection;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;

/// Shared connection. Lock after any service-level lock, never before.
pub type Db = Arc<Mutex<Connection>>;

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS login_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL,
  success INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp INTEGER NOT NULL,
  title TEXT NOT NULL,
  url TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);

CREATE TABLE IF NOT EXISTS time_report (
  category TEXT PRIMARY KEY,
  duration INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS whitelist_categories (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS whitelist_hosts (
  category TEXT NOT NULL,
  host TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (category, host)
);

CREATE TABLE IF NOT EXISTS tracking_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  time_tracking INTEGER NOT NULL DEFAULT 0,
  history_logging INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);
INSERT INTO tracking_state (id, time_tracking, history_logging, updated_at)
VALUES (1, 0, 0, '1970-01-01T00:00:00Z')
ON CONFLICT(id) DO NOTHING;
"#,
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackingFlags {
    pub time_tracking: bool,
    pub history_logging: bool,
    pub updated_at: String,
}

pub fn load_tracking_flags(conn: &mut Connection) -> rusqlite::Result<TrackingFlags> {
    let mut stmt = conn.prepare(
        "SELECT time_tracking, history_logging, updated_at FROM tracking_state WHERE id = 1",
    )?;
    stmt.query_row([], |row| {
        let time_tracking: i64 = row.get(0)?;
        let history_logging: i64 = row.get(1)?;
        Ok(TrackingFlags {
            time_tracking: time_tracking != 0,
            history_logging: history_logging != 0,
            updated_at: row.get(2)?,
        })
    })
}

pub fn set_time_tracking(conn: &mut Connection, on: bool, updated_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tracking_state SET time_tracking = ?1, updated_at = ?2 WHERE id = 1",
        (on as i64, updated_at),
    )?;
    Ok(())
}

pub fn set_history_logging(
    conn: &mut Connection,
    on: bool,
    updated_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tracking_state SET history_logging = ?1, updated_at = ?2 WHERE id = 1",
        (on as i64, updated_at),
    )?;
    Ok(())
}

pub fn insert_login_attempt(conn: &mut Connection, ts: &str, success: bool) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO login_log (ts, success) VALUES (?1, ?2)",
        (ts, success as i64),
    )?;
    Ok(())
}

pub fn list_login_attempts(conn: &mut Connection) -> rusqlite::Result<Vec<LoginAttempt>> {
    let mut stmt = conn.prepare("SELECT id, ts, success FROM login_log ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        let success: i64 = row.get(2)?;
        Ok(LoginAttempt {
            id: row.get(0)?,
            ts: row.get(1)?,
            success: success != 0,
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn clear_login_log(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM login_log", [])
}

/// Appends a batch in one transaction; nothing is written if any row fails.
pub fn insert_visits(conn: &mut Connection, visits: &[Visit]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO history (timestamp, title, url) VALUES (?1, ?2, ?3)")?;
        for v in visits {
            stmt.execute((v.timestamp, &v.title, &v.url))?;
        }
    }
    tx.commit()
}

pub fn list_visits(conn: &mut Connection) -> rusqlite::Result<Vec<Visit>> {
    let mut stmt = conn.prepare("SELECT timestamp, title, url FROM history ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok(Visit {
            timestamp: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn clear_history(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM history", [])
}

pub fn load_time_report(conn: &mut Connection) -> rusqlite::Result<TimeReport> {
    let mut stmt = conn.prepare("SELECT category, duration FROM time_report")?;
    let rows = stmt.query_map([], |row| {
        let duration: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, duration.max(0) as u64))
    })?;

    let mut pairs = Vec::new();
    for r in rows {
        pairs.push(r?);
    }
    Ok(TimeReport::from_durations(pairs))
}

/// Replaces the stored report with `report`.
pub fn save_time_report(conn: &mut Connection, report: &TimeReport) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM time_report", [])?;
    {
        let mut stmt = tx.prepare("INSERT INTO time_report (category, duration) VALUES (?1, ?2)")?;
        for (category, duration) in report.iter() {
            stmt.execute((category, duration as i64))?;
        }
    }
    tx.commit()
}

/// Writes the current duration of each named category.
pub fn save_durations(
    conn: &mut Connection,
    report: &TimeReport,
    categories: &[String],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            r#"
INSERT INTO time_report (category, duration) VALUES (?1, ?2)
ON CONFLICT(category) DO UPDATE SET duration = excluded.duration
"#,
        )?;
        for category in categories {
            if let Some(duration) = report.duration(category) {
                stmt.execute((category, duration as i64))?;
            }
        }
    }
    tx.commit()
}

pub fn clear_time_report(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM time_report", [])
}

pub fn load_whitelist(conn: &mut Connection) -> rusqlite::Result<Whitelist> {
    let mut wl = Whitelist::new();

    let mut stmt = conn.prepare("SELECT name FROM whitelist_categories")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for r in rows {
        wl.insert_category(&r?);
    }

    let mut stmt = conn.prepare(
        r#"
SELECT h.category, h.host FROM whitelist_hosts h
JOIN whitelist_categories c ON c.name = h.category
"#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for r in rows {
        let (category, host) = r?;
        wl.insert_host(&category, &host);
    }

    Ok(wl)
}

/// Returns `false` if the category already existed.
pub fn insert_whitelist_category(
    conn: &mut Connection,
    name: &str,
    created_at: &str,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "INSERT INTO whitelist_categories (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        (name, created_at),
    )?;
    Ok(n > 0)
}

/// Removes a category together with its hosts. Returns `false` if it did not exist.
pub fn delete_whitelist_category(conn: &mut Connection, name: &str) -> rusqlite::Result<bool> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM whitelist_hosts WHERE category = ?1", [name])?;
    let n = tx.execute("DELETE FROM whitelist_categories WHERE name = ?1", [name])?;
    tx.commit()?;
    Ok(n > 0)
}

/// Returns `false` if the host was already listed under the category.
pub fn insert_whitelist_host(
    conn: &mut Connection,
    category: &str,
    host: &str,
    created_at: &str,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        r#"
INSERT INTO whitelist_hosts (category, host, created_at) VALUES (?1, ?2, ?3)
ON CONFLICT(category, host) DO NOTHING
"#,
        (category, host, created_at),
    )?;
    Ok(n > 0)
}

pub fn delete_whitelist_host(
    conn: &mut Connection,
    category: &str,
    host: &str,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM whitelist_hosts WHERE category = ?1 AND host = ?2",
        (category, host),
    )?;
    Ok(n > 0)
}

#[cfg(test)]
pub(crate) fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_db(&conn).unwrap();
    conn
}
