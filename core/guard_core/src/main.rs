use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Local;
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

mod db;
mod logs;
mod tabs;
mod tracker;
mod whitelist;

use db::Db;
use logs::{HistoryLog, Recorded, Visit};
use tabs::OpenTabs;
use tracker::{TimeReport, TimeTracker};

const DEFAULT_PORT: u16 = 17610;
const MIN_TAB_FRESHNESS_SECONDS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "guard_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts ip:port (e.g. 127.0.0.1:17610), ip (implies port 17610),
    /// or localhost[:port].
    #[arg(long, default_value = "127.0.0.1:17610")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/guard-core.db")]
    db: PathBuf,

    /// Buffered history visits that force a write to the database.
    #[arg(long, default_value_t = 500)]
    history_buffer_max: usize,

    /// How long an open-tabs snapshot from the extension stays valid (seconds).
    ///
    /// Must cover the extension's snapshot interval; older snapshots count as
    /// no tabs open.
    #[arg(long, default_value_t = 300)]
    tab_freshness_seconds: u64,
}

#[derive(Clone)]
struct AppState {
    db: Db,
    tracker: TimeTracker,
    history: HistoryLog,
    tabs: Arc<OpenTabs>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err_response(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

/// Messages the settings panel sends over its port.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum PanelMessage {
    StartTracking,
    StopTracking,
    QueryReport,
    ClearReport,
    TrackingStatus,
    LoginAttempt { success: bool },
    QueryLoginLog,
    ClearLoginLog,
    StartHistory,
    StopHistory,
    HistoryStatus,
    QueryHistory,
    ClearHistory,
    ClearLog { log: LogKind },
}

impl PanelMessage {
    fn name(&self) -> &'static str {
        match self {
            PanelMessage::StartTracking => "start-tracking",
            PanelMessage::StopTracking => "stop-tracking",
            PanelMessage::QueryReport => "query-report",
            PanelMessage::ClearReport => "clear-report",
            PanelMessage::TrackingStatus => "tracking-status",
            PanelMessage::LoginAttempt { .. } => "login-attempt",
            PanelMessage::QueryLoginLog => "query-login-log",
            PanelMessage::ClearLoginLog => "clear-login-log",
            PanelMessage::StartHistory => "start-history",
            PanelMessage::StopHistory => "stop-history",
            PanelMessage::HistoryStatus => "history-status",
            PanelMessage::QueryHistory => "query-history",
            PanelMessage::ClearHistory => "clear-history",
            PanelMessage::ClearLog { .. } => "clear-log",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LogKind {
    Login,
    History,
    Time,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum PanelReply {
    ReportReady { report: TimeReport },
    TrackingStatus { running: bool },
    LoginLogRead { events: Vec<String> },
    HistoryStatus { logging: bool, pending: usize },
    HistoryLogRead { visits: Vec<Visit> },
}

#[derive(Deserialize)]
struct TabsSnapshot {
    v: i32,
    ts: String,
    tabs: Vec<OpenTab>,
}

#[derive(Deserialize)]
struct OpenTab {
    url: String,
}

#[derive(Serialize)]
struct TabsAccepted {
    hosts: usize,
}

#[derive(Deserialize)]
struct VisitEvent {
    v: i32,
    ts: String,
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Serialize)]
struct VisitAccepted {
    logged: bool,
}

#[derive(Deserialize)]
struct CategoryUpsert {
    category: String,
}

#[derive(Deserialize)]
struct HostUpsert {
    category: String,
    host: String,
}

#[derive(Serialize)]
struct WhitelistChange {
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    changed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guard_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(&args.db)?;
    db::init_db(&conn)?;
    let db: Db = Arc::new(Mutex::new(conn));

    let tabs = Arc::new(OpenTabs::new(Duration::from_secs(
        args.tab_freshness_seconds.max(MIN_TAB_FRESHNESS_SECONDS),
    )));
    let tracker = TimeTracker::load(db.clone(), tabs.clone()).await?;
    let history = HistoryLog::load(db.clone(), args.history_buffer_max).await?;

    let flags = {
        let mut conn = db.lock().await;
        db::load_tracking_flags(&mut conn)?
    };
    if flags.time_tracking {
        tracker.start().await?;
        info!("resumed time tracking from previous run");
    }
    if flags.history_logging {
        info!("history logging is on");
    }

    let state = AppState {
        db,
        tracker,
        history,
        tabs,
    };
    let app = router(state.clone());

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = state.history.flush().await {
        error!("history flush on shutdown failed: {err}");
    }
    if let Err(err) = state.tracker.suspend().await {
        error!("time report save on shutdown failed: {err}");
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/message", post(post_message).options(options_ok))
        .route("/tabs", post(post_tabs).options(options_ok))
        .route("/history/visit", post(post_history_visit).options(options_ok))
        .route("/whitelist", get(get_whitelist))
        .route(
            "/whitelist/category",
            post(post_whitelist_category).options(options_ok),
        )
        .route(
            "/whitelist/category/:name",
            delete(delete_whitelist_category).options(options_ok),
        )
        .route("/whitelist/host", post(post_whitelist_host).options(options_ok))
        .route(
            "/whitelist/host/delete",
            post(post_whitelist_host_delete).options(options_ok),
        )
        .with_state(state)
        .layer(cors)
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "guard_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn post_message(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let msg: PanelMessage = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_message"),
    };

    let name = msg.name();
    match dispatch(&state, msg).await {
        Ok(reply) => ok_response(reply),
        Err(err) => {
            error!("{name} failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn dispatch(state: &AppState, msg: PanelMessage) -> rusqlite::Result<PanelReply> {
    match msg {
        PanelMessage::StartTracking => {
            state.tracker.start().await?;
            Ok(PanelReply::TrackingStatus { running: true })
        }
        PanelMessage::StopTracking => {
            state.tracker.stop().await?;
            Ok(PanelReply::TrackingStatus { running: false })
        }
        PanelMessage::TrackingStatus => Ok(PanelReply::TrackingStatus {
            running: state.tracker.is_running().await,
        }),
        PanelMessage::QueryReport => Ok(PanelReply::ReportReady {
            report: state.tracker.query().await?,
        }),
        PanelMessage::ClearReport
        | PanelMessage::ClearLog {
            log: LogKind::Time,
        } => {
            state.tracker.clear().await?;
            Ok(PanelReply::ReportReady {
                report: state.tracker.query().await?,
            })
        }
        PanelMessage::LoginAttempt { success } => {
            let ts = logs::login_timestamp(Local::now());
            let mut conn = state.db.lock().await;
            db::insert_login_attempt(&mut conn, &ts, success)?;
            info!(success, "login attempt logged");
            login_log_read(&mut conn)
        }
        PanelMessage::QueryLoginLog => {
            let mut conn = state.db.lock().await;
            login_log_read(&mut conn)
        }
        PanelMessage::ClearLoginLog
        | PanelMessage::ClearLog {
            log: LogKind::Login,
        } => {
            let mut conn = state.db.lock().await;
            let removed = db::clear_login_log(&mut conn)?;
            info!(removed, "login log cleared");
            login_log_read(&mut conn)
        }
        PanelMessage::StartHistory => {
            let s = state.history.start().await?;
            Ok(PanelReply::HistoryStatus {
                logging: s.logging,
                pending: s.pending,
            })
        }
        PanelMessage::StopHistory => {
            let s = state.history.stop().await?;
            Ok(PanelReply::HistoryStatus {
                logging: s.logging,
                pending: s.pending,
            })
        }
        PanelMessage::HistoryStatus => {
            let s = state.history.status().await;
            Ok(PanelReply::HistoryStatus {
                logging: s.logging,
                pending: s.pending,
            })
        }
        PanelMessage::QueryHistory => Ok(PanelReply::HistoryLogRead {
            visits: state.history.read().await?,
        }),
        PanelMessage::ClearHistory
        | PanelMessage::ClearLog {
            log: LogKind::History,
        } => Ok(PanelReply::HistoryLogRead {
            visits: state.history.clear().await?,
        }),
    }
}

fn login_log_read(conn: &mut Connection) -> rusqlite::Result<PanelReply> {
    let events = db::list_login_attempts(conn)?
        .iter()
        .map(|a| a.line())
        .collect();
    Ok(PanelReply::LoginLogRead { events })
}

fn validate_header(v: i32, ts: &str) -> Result<OffsetDateTime, &'static str> {
    if v < 1 {
        return Err("invalid_version");
    }
    OffsetDateTime::parse(ts, &Rfc3339).map_err(|_| "invalid_ts")
}

async fn post_tabs(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let snapshot: TabsSnapshot = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_json"),
    };
    if let Err(code) = validate_header(snapshot.v, &snapshot.ts) {
        return err_response(StatusCode::BAD_REQUEST, code);
    }

    match state.tabs.update(snapshot.tabs.iter().map(|t| t.url.as_str())) {
        Ok(hosts) => ok_response(TabsAccepted { hosts }),
        Err(err) => {
            error!("open tabs update failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

async fn post_history_visit(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let e: VisitEvent = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_json"),
    };
    let ts = match validate_header(e.v, &e.ts) {
        Ok(ts) => ts,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };

    let visit = Visit {
        timestamp: (ts.unix_timestamp_nanos() / 1_000_000) as i64,
        title: e.title.unwrap_or_default(),
        url: e.url,
    };
    match state.history.record(visit).await {
        Ok(recorded) => ok_response(VisitAccepted {
            logged: recorded != Recorded::Ignored,
        }),
        Err(err) => {
            error!("history record failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn get_whitelist(State(state): State<AppState>) -> Response {
    let mut conn = state.db.lock().await;
    match db::load_whitelist(&mut conn) {
        Ok(wl) => ok_response(wl),
        Err(err) => {
            error!("load_whitelist failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn post_whitelist_category(
    State(state): State<AppState>,
    Json(req): Json<CategoryUpsert>,
) -> Response {
    let Some(category) = whitelist::normalize_category(&req.category) else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_category");
    };

    let mut conn = state.db.lock().await;
    match db::insert_whitelist_category(&mut conn, &category, &db::now_rfc3339()) {
        Ok(changed) => {
            if changed {
                info!(category = %category, "whitelist category added");
            }
            ok_response(WhitelistChange {
                category,
                host: None,
                changed,
            })
        }
        Err(err) => {
            error!("insert_whitelist_category failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn delete_whitelist_category(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let Some(name) = whitelist::normalize_category(&name) else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_category");
    };

    let mut conn = state.db.lock().await;
    match db::delete_whitelist_category(&mut conn, &name) {
        Ok(true) => {
            info!(category = %name, "whitelist category removed");
            ok_response(WhitelistChange {
                category: name,
                host: None,
                changed: true,
            })
        }
        Ok(false) => err_response(StatusCode::NOT_FOUND, "unknown_category"),
        Err(err) => {
            error!("delete_whitelist_category failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn post_whitelist_host(State(state): State<AppState>, Json(req): Json<HostUpsert>) -> Response {
    let Some(category) = whitelist::normalize_category(&req.category) else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_category");
    };
    let Some(host) = whitelist::normalize_host(&req.host) else {
        return err_response(StatusCode::BAD_REQUEST, "malformed_url");
    };

    let mut conn = state.db.lock().await;
    let wl = match db::load_whitelist(&mut conn) {
        Ok(v) => v,
        Err(err) => {
            error!("load_whitelist failed: {err}");
            return err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error");
        }
    };
    if !wl.contains_category(&category) {
        return err_response(StatusCode::NOT_FOUND, "unknown_category");
    }
    if wl.contains_host(&category, &host) {
        return err_response(StatusCode::CONFLICT, "host_already_added");
    }

    match db::insert_whitelist_host(&mut conn, &category, &host, &db::now_rfc3339()) {
        Ok(true) => {
            info!(category = %category, host = %host, "whitelist host added");
            ok_response(WhitelistChange {
                category,
                host: Some(host),
                changed: true,
            })
        }
        Ok(false) => err_response(StatusCode::CONFLICT, "host_already_added"),
        Err(err) => {
            error!("insert_whitelist_host failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn post_whitelist_host_delete(
    State(state): State<AppState>,
    Json(req): Json<HostUpsert>,
) -> Response {
    let Some(category) = whitelist::normalize_category(&req.category) else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_category");
    };
    let Some(host) = whitelist::normalize_host(&req.host) else {
        return err_response(StatusCode::BAD_REQUEST, "malformed_url");
    };

    let mut conn = state.db.lock().await;
    match db::delete_whitelist_host(&mut conn, &category, &host) {
        Ok(true) => {
            info!(category = %category, host = %host, "whitelist host removed");
            ok_response(WhitelistChange {
                category,
                host: Some(host),
                changed: true,
            })
        }
        Ok(false) => err_response(StatusCode::NOT_FOUND, "unknown_host"),
        Err(err) => {
            error!("delete_whitelist_host failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}
