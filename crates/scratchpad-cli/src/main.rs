//! scratchpad: end-to-end encrypted two-party scratchpad client
//!
//! Commands:
//!   connect <id>        - select a connection (adds it to the known list)
//!   list                - show known connections
//!   remove [<id>]       - forget a connection and its key
//!   fingerprint [<id>]  - print the 26-word mnemonic of a connection key
//!   status [<id>]       - relay health and the relay's record for a connection
//!   create              - ask the relay for a new connection id (admin token)
//!   config show         - display current configuration
//!   run [<id>]          - interactive session on stdin/stdout

mod repl;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scratchpad_core::config::ScratchpadConfig;
use scratchpad_core::types::ConnectionId;
use scratchpad_sync::relay::{HttpRelay, RelayApi};
use scratchpad_sync::{JsonFileStore, KeyStore};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "scratchpad",
    version,
    about = "Encrypted scratchpad shared between two devices",
    long_about = "scratchpad: pair with another device through a relay and keep a text pad \
                  and file list in sync, encrypted end to end"
)]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "SCRATCHPAD_CONFIG",
        default_value = "~/.config/scratchpad/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "SCRATCHPAD_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "SCRATCHPAD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Select a connection, adding it to the known list
    Connect {
        /// Connection id (UUID) handed out by the relay
        id: ConnectionId,
    },

    /// List known connections (* marks the current one)
    List,

    /// Forget a connection: list entry, symmetric key and selection
    Remove {
        /// Connection id (default: the current connection)
        id: Option<ConnectionId>,
    },

    /// Print the key fingerprint to compare with the other device
    Fingerprint {
        /// Connection id (default: the current connection)
        id: Option<ConnectionId>,
    },

    /// Show relay health and what the relay holds for a connection
    Status {
        /// Connection id (default: the current connection)
        id: Option<ConnectionId>,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new connection on the relay
    Create {
        /// Relay admin bearer token
        #[arg(long, env = "SCRATCHPAD_ADMIN_BEARER")]
        admin_token: String,
        /// Also select the new connection
        #[arg(long)]
        select: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Open an interactive session
    ///
    /// Each stdin line replaces the document text. Lines starting with ':'
    /// are commands: :append <text>, :file <path>, :rm <index>, :show, :quit.
    Run {
        /// Connection id (default: the current connection)
        id: Option<ConnectionId>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let loaded = load_config(&config_path).await?;
    let config = loaded.clone().unwrap_or_default();

    let level = cli.log.as_deref().unwrap_or(config.client.log_level.as_str());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| log_format_from_config(&config.client.log_format));
    init_logging(level, &format);

    if loaded.is_none() {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    match cli.command {
        Commands::Connect { id } => cmd_connect(&config, id),
        Commands::List => cmd_list(&config),
        Commands::Remove { id } => cmd_remove(&config, id),
        Commands::Fingerprint { id } => cmd_fingerprint(&config, id),
        Commands::Status { id, json } => cmd_status(&config, id, json).await,
        Commands::Create { admin_token, select } => cmd_create(&config, &admin_token, select).await,
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&config, &config_path, loaded.is_some())
        }
        Commands::Run { id } => {
            let store = open_keystore(&config)?;
            repl::run(&config, store, id).await
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// `None` when the file does not exist.
async fn load_config(path: &Path) -> Result<Option<ScratchpadConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(Some(config))
}

fn log_format_from_config(value: &str) -> LogFormat {
    if value.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// Logs go to stderr; stdout belongs to the document.
fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn open_keystore(config: &ScratchpadConfig) -> Result<KeyStore<JsonFileStore>> {
    let path = expand_tilde(&config.client.store_path);
    let store = JsonFileStore::open(&path)
        .with_context(|| format!("opening key store: {}", path.display()))?;
    Ok(KeyStore::new(store))
}

/// The given id, or the stored current connection.
fn resolve_connection(
    store: &KeyStore<JsonFileStore>,
    id: Option<ConnectionId>,
) -> Result<ConnectionId> {
    match id {
        Some(id) => Ok(id),
        None => store
            .current_connection()?
            .context("no connection selected; pass an id or run `scratchpad connect <id>`"),
    }
}

// ── `scratchpad connect` ──────────────────────────────────────────────────────

fn cmd_connect(config: &ScratchpadConfig, id: ConnectionId) -> Result<()> {
    let mut store = open_keystore(config)?;
    if store.add_connection(&id)? {
        info!(connection = %id, "added connection");
    }
    store.set_current_connection(Some(&id))?;
    println!("current connection: {id}");
    Ok(())
}

// ── `scratchpad list` ─────────────────────────────────────────────────────────

fn cmd_list(config: &ScratchpadConfig) -> Result<()> {
    let store = open_keystore(config)?;
    let connections = store.connections()?;
    if connections.is_empty() {
        println!("no connections yet; run `scratchpad connect <id>`");
        return Ok(());
    }

    let current = store.current_connection()?;
    for id in connections {
        let marker = if Some(id) == current { "*" } else { " " };
        let keyed = if store.load_common_key(&id)?.is_some() {
            "paired"
        } else {
            "waiting for peer"
        };
        println!("{marker} {id}  ({keyed})");
    }
    Ok(())
}

// ── `scratchpad remove` ───────────────────────────────────────────────────────

fn cmd_remove(config: &ScratchpadConfig, id: Option<ConnectionId>) -> Result<()> {
    let mut store = open_keystore(config)?;
    let id = resolve_connection(&store, id)?;
    store.forget_connection(&id)?;
    println!("removed {id}");
    Ok(())
}

// ── `scratchpad fingerprint` ──────────────────────────────────────────────────

fn cmd_fingerprint(config: &ScratchpadConfig, id: Option<ConnectionId>) -> Result<()> {
    let store = open_keystore(config)?;
    let id = resolve_connection(&store, id)?;
    match store.fingerprint(&id)? {
        Some(words) => {
            for line in words.chunks(6) {
                println!("{}", line.join(" "));
            }
        }
        None => println!("{id}: no key yet (the other device has not joined)"),
    }
    Ok(())
}

// ── `scratchpad status` ───────────────────────────────────────────────────────

async fn cmd_status(config: &ScratchpadConfig, id: Option<ConnectionId>, json: bool) -> Result<()> {
    let store = open_keystore(config)?;
    let relay = HttpRelay::new(&config.client)?;

    let health = relay
        .status()
        .await
        .with_context(|| format!("reaching relay at {}", relay.base()))?;

    let id = match id {
        Some(id) => Some(id),
        None => store.current_connection()?,
    };
    let record = match &id {
        Some(id) => Some(relay.fetch_record(id).await?),
        None => None,
    };
    // Read-only: do not mint a keypair just to look at a record.
    let local = store.load_keypair()?;
    let registered = match (&record, &local) {
        (Some(record), Some(local)) => record.locate(local).local_registered,
        _ => false,
    };

    if json {
        let summary = serde_json::json!({
            "relay": health,
            "connection": id,
            "parties": record.as_ref().map(|r| r.parties()),
            "registered": registered,
            "has_text": record.as_ref().is_some_and(|r| r.last_text.is_some()),
            "has_files": record.as_ref().is_some_and(|r| r.last_files.is_some()),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("relay {} v{}", health.service, health.version);
    println!("  endpoint:    {}", relay.base());
    println!("  status:      {}", health.status);

    let (Some(id), Some(record)) = (id, record) else {
        println!("  connection:  none selected");
        return Ok(());
    };
    println!("  connection:  {id}");
    println!("  key slots:   {}/2", record.parties());
    println!("  this device: {}", if registered { "registered" } else { "not registered" });
    println!("  local key:   {}", if store.load_common_key(&id)?.is_some() { "derived" } else { "none" });
    println!("  last text:   {}", if record.last_text.is_some() { "stored" } else { "none" });
    println!("  last files:  {}", if record.last_files.is_some() { "stored" } else { "none" });
    Ok(())
}

// ── `scratchpad create` ───────────────────────────────────────────────────────

async fn cmd_create(config: &ScratchpadConfig, admin_token: &str, select: bool) -> Result<()> {
    let relay = HttpRelay::new(&config.client)?;
    let id = relay
        .create_connection(admin_token)
        .await
        .context("creating connection")?;

    let mut store = open_keystore(config)?;
    store.add_connection(&id)?;
    if select {
        store.set_current_connection(Some(&id))?;
    }
    info!(connection = %id, selected = select, "created connection");
    println!("{id}");
    Ok(())
}

// ── `scratchpad config show` ──────────────────────────────────────────────────

fn cmd_config_show(config: &ScratchpadConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
