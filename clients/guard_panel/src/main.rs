use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "guard_panel", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17610
    #[arg(long, default_value = "http://127.0.0.1:17610")]
    core_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start counting time per whitelist category.
    Start,
    /// Stop counting time.
    Stop,
    /// Whether time tracking is running.
    Status,
    /// Print the time report.
    Report,
    /// Record a login attempt.
    Login {
        /// Record a failed attempt instead of a successful one.
        #[arg(long, default_value_t = false)]
        failed: bool,
    },
    /// Print the login log.
    LoginLog,
    /// Turn browsing history logging on.
    HistoryStart,
    /// Turn browsing history logging off (pending visits are written).
    HistoryStop,
    /// Whether history logging is on and how many visits are pending.
    HistoryStatus,
    /// Print the browsing history.
    History,
    /// Clear one of the logs and print what is left.
    Clear {
        #[arg(value_enum)]
        log: LogKind,
    },
    /// Edit or print the custom whitelist categories.
    #[command(subcommand)]
    Whitelist(WhitelistCommand),
}

#[derive(Subcommand, Debug)]
enum WhitelistCommand {
    List,
    AddCategory { category: String },
    RemoveCategory { category: String },
    AddHost { category: String, host: String },
    RemoveHost { category: String, host: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogKind {
    Login,
    History,
    Time,
}

impl LogKind {
    fn as_str(self) -> &'static str {
        match self {
            LogKind::Login => "login",
            LogKind::History => "history",
            LogKind::Time => "time",
        }
    }
}

/// One call against the core.
#[derive(Debug, PartialEq)]
enum Request {
    Message(Value),
    Get(String),
    Post(String, Value),
    Delete(String),
}

fn request_for(command: &Command) -> Request {
    let msg = |t: &str| Request::Message(json!({ "type": t }));
    match command {
        Command::Start => msg("start-tracking"),
        Command::Stop => msg("stop-tracking"),
        Command::Status => msg("tracking-status"),
        Command::Report => msg("query-report"),
        Command::Login { failed } => {
            Request::Message(json!({ "type": "login-attempt", "success": !failed }))
        }
        Command::LoginLog => msg("query-login-log"),
        Command::HistoryStart => msg("start-history"),
        Command::HistoryStop => msg("stop-history"),
        Command::HistoryStatus => msg("history-status"),
        Command::History => msg("query-history"),
        Command::Clear { log } => {
            Request::Message(json!({ "type": "clear-log", "log": log.as_str() }))
        }
        Command::Whitelist(w) => match w {
            WhitelistCommand::List => Request::Get("/whitelist".to_string()),
            WhitelistCommand::AddCategory { category } => Request::Post(
                "/whitelist/category".to_string(),
                json!({ "category": category }),
            ),
            WhitelistCommand::RemoveCategory { category } => {
                Request::Delete(format!("/whitelist/category/{}", urlencoding::encode(category)))
            }
            WhitelistCommand::AddHost { category, host } => Request::Post(
                "/whitelist/host".to_string(),
                json!({ "category": category, "host": host }),
            ),
            WhitelistCommand::RemoveHost { category, host } => Request::Post(
                "/whitelist/host/delete".to_string(),
                json!({ "category": category, "host": host }),
            ),
        },
    }
}

#[derive(Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

async fn send(client: &reqwest::Client, base_url: &str, req: &Request) -> anyhow::Result<Value> {
    let res = match req {
        Request::Message(body) => client.post(format!("{base_url}/message")).json(body).send(),
        Request::Get(path) => client.get(format!("{base_url}{path}")).send(),
        Request::Post(path, body) => client.post(format!("{base_url}{path}")).json(body).send(),
        Request::Delete(path) => client.delete(format!("{base_url}{path}")).send(),
    }
    .await?;

    let status = res.status();
    let body: Envelope = res.json().await?;
    if !body.ok {
        anyhow::bail!(
            "{} (http_{})",
            body.error.as_deref().unwrap_or("not_ok"),
            status.as_u16()
        );
    }
    body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guard_panel=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let base_url = args.core_url.trim_end_matches('/');
    let req = request_for(&args.command);
    debug!(?req, "sending");

    let client = reqwest::Client::new();
    let data = send(&client, base_url, &req).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Command {
        let mut full = vec!["guard_panel"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap().command
    }

    #[test]
    fn tracking_commands_map_to_messages() {
        assert_eq!(
            request_for(&parse(&["start"])),
            Request::Message(json!({"type": "start-tracking"}))
        );
        assert_eq!(
            request_for(&parse(&["report"])),
            Request::Message(json!({"type": "query-report"}))
        );
        assert_eq!(
            request_for(&parse(&["history-status"])),
            Request::Message(json!({"type": "history-status"}))
        );
        assert_eq!(
            request_for(&parse(&["clear", "time"])),
            Request::Message(json!({"type": "clear-log", "log": "time"}))
        );
    }

    #[test]
    fn login_defaults_to_success() {
        assert_eq!(
            request_for(&parse(&["login"])),
            Request::Message(json!({"type": "login-attempt", "success": true}))
        );
        assert_eq!(
            request_for(&parse(&["login", "--failed"])),
            Request::Message(json!({"type": "login-attempt", "success": false}))
        );
    }

    #[test]
    fn whitelist_commands_map_to_routes() {
        assert_eq!(
            request_for(&parse(&["whitelist", "add-host", "news", "bbc.com"])),
            Request::Post(
                "/whitelist/host".to_string(),
                json!({"category": "news", "host": "bbc.com"})
            )
        );
        assert_eq!(
            request_for(&parse(&["whitelist", "remove-category", "social media"])),
            Request::Delete("/whitelist/category/social%20media".to_string())
        );
        assert_eq!(
            request_for(&parse(&["whitelist", "remove-category", "jeux/vidéo"])),
            Request::Delete("/whitelist/category/jeux%2Fvid%C3%A9o".to_string())
        );
    }

    #[test]
    fn unknown_log_kind_is_rejected() {
        assert!(Args::try_parse_from(["guard_panel", "clear", "everything"]).is_err());
    }
}
