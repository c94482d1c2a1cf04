// ABOUTME: Entry point for the wrpc diagnostic CLI.
// ABOUTME: Dispatches call, list, wait-exists, wait-removed, mask and version subcommands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wrpc_client::probe::field_equals;
use wrpc_client::{
    find_duplicate, raw_record, record_exists, record_removed, Client, Config, Envelope, WsDialer,
};
use wrpc_cli::{list_query, mask_for, parse_body, VERSION};

#[derive(Parser)]
#[command(name = "wrpc")]
#[command(about = "Diagnostic CLI for the orchestration backend RPC channel")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults to ~/.config/wrpc/config.toml)
    #[arg(long, global = true, env = "WRPC_CONFIG")]
    config: Option<PathBuf>,

    /// Log exchanges at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to ~/.config/wrpc/wrpc.log instead of stderr (honours --verbose)
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Service name (e.g., Network.Vpc)
    service: String,

    /// Method name (e.g., List)
    method: String,

    /// Request body as JSON
    #[arg(long)]
    body: Option<String>,
}

#[derive(Args)]
struct Match {
    /// Only result keys starting with this are records
    #[arg(long, default_value = "")]
    key_prefix: String,

    /// Dotted field path to match records on
    #[arg(long)]
    field: String,

    /// Value the field must equal
    #[arg(long)]
    equals: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a single-result call and print the result
    Call {
        #[command(flatten)]
        target: Target,

        /// Correlation token (random if omitted)
        #[arg(long)]
        token: Option<String>,
    },

    /// Issue a list-style call and print one record per line
    List {
        #[command(flatten)]
        target: Target,

        /// Only result keys starting with this are records
        #[arg(long, default_value = "")]
        key_prefix: String,
    },

    /// Poll until a matching record is listed
    WaitExists {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        matching: Match,

        /// Also wait for this dotted field of the record to be populated
        #[arg(long)]
        populated: Option<String>,

        /// Deadline in seconds (defaults to the configured availability timeout)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Fail immediately if the record is not there yet instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Poll until no matching record is listed
    WaitRemoved {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        matching: Match,

        /// Deadline in seconds (defaults to the configured deletion timeout)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Derive the field mask of a JSON payload (no backend needed)
    Mask {
        /// Payload as JSON
        payload: String,

        /// Path prefix for every entry
        #[arg(long, default_value = "")]
        prefix: String,

        /// Embedded field to expand into its own paths (repeatable)
        #[arg(long)]
        inner: Vec<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if cli.log_file {
        wrpc_log::init_file_with_level("wrpc", level);
    } else {
        wrpc_log::init_with_level(level);
    }

    match cli.command {
        Commands::Mask {
            payload,
            prefix,
            inner,
        } => {
            let mask = mask_for(&payload, &prefix, &inner)?;
            println!("{}", serde_json::to_string_pretty(&mask)?);
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Call { target, token } => {
            let (_, client) = backend(cli.config)?;
            call(&client, target, token).await
        }
        Commands::List { target, key_prefix } => {
            let (_, client) = backend(cli.config)?;
            list(&client, target, &key_prefix).await
        }
        Commands::WaitExists {
            target,
            matching,
            populated,
            timeout_secs,
            once,
        } => {
            let (config, client) = backend(cli.config)?;
            wait_exists(&config, &client, target, matching, populated, timeout_secs, once).await
        }
        Commands::WaitRemoved {
            target,
            matching,
            timeout_secs,
        } => {
            let (config, client) = backend(cli.config)?;
            wait_removed(&config, &client, target, matching, timeout_secs).await
        }
    }
}

/// Load config and build a client that Ctrl-C cancels.
fn backend(path: Option<PathBuf>) -> Result<(Config, Client<WsDialer>)> {
    let config = Config::load(path).context("Failed to load wrpc config")?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    let client = config
        .client()
        .context("Invalid backend settings")?
        .with_cancellation(cancel);
    Ok((config, client))
}

/// Cancel in-flight work on Ctrl-C.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

async fn call(client: &Client<WsDialer>, target: Target, token: Option<String>) -> Result<()> {
    let mut envelope =
        Envelope::new(&target.service, &target.method, parse_body(target.body.as_deref())?);
    if let Some(token) = token {
        envelope = envelope.with_token(token);
    }
    let result = client.call(&envelope).await?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(result))?);
    Ok(())
}

async fn list(client: &Client<WsDialer>, target: Target, key_prefix: &str) -> Result<()> {
    let query = list_query(&target.service, &target.method, target.body.as_deref(), key_prefix)?;
    let records = client
        .list(&query.envelope(), |key: &str| key.starts_with(key_prefix), raw_record)
        .await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    eprintln!("{} record(s)", records.len());
    Ok(())
}

async fn wait_exists(
    config: &Config,
    client: &Client<WsDialer>,
    target: Target,
    matching: Match,
    populated: Option<String>,
    timeout_secs: Option<u64>,
    once: bool,
) -> Result<()> {
    let query = list_query(
        &target.service,
        &target.method,
        target.body.as_deref(),
        &matching.key_prefix,
    )?;
    let predicate = field_equals(&matching.field, &matching.equals);

    if once {
        return match find_duplicate(client, &query, predicate).await? {
            Some(record) => {
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            None => anyhow::bail!("No record with {} = {}", matching.field, matching.equals),
        };
    }

    let mut policy = config.availability_policy();
    if let Some(secs) = timeout_secs {
        policy = policy.with_deadline(Duration::from_secs(secs));
    }

    let found = match populated {
        Some(field) => {
            wrpc_client::field_populated(client, &policy, &query, predicate, &field).await?
        }
        None => record_exists(client, &policy, &query, predicate).await?,
    };
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

async fn wait_removed(
    config: &Config,
    client: &Client<WsDialer>,
    target: Target,
    matching: Match,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let query = list_query(
        &target.service,
        &target.method,
        target.body.as_deref(),
        &matching.key_prefix,
    )?;
    let mut policy = config.deletion_policy();
    if let Some(secs) = timeout_secs {
        policy = policy.with_deadline(Duration::from_secs(secs));
    }

    record_removed(
        client,
        &policy,
        &query,
        field_equals(&matching.field, &matching.equals),
    )
    .await?;
    println!("Removed.");
    Ok(())
}

/// Print version information
fn print_version() {
    println!("wrpc {}", VERSION);
}
