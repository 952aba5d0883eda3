//! stomp-output binary entry point.
//!
//! Usage: stomp-output --host <host> --destination <template> [--header name=template]...
//!
//! Reads one event per line from stdin (JSON objects, or plain text wrapped
//! as `{"message": ...}`) and publishes them in batches.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use stomp_output::logging::{default_level, init_logging};
use stomp_output::{JsonEvent, StompError, StompOutput, StompOutputConfig, StompResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Publish newline-delimited events to a STOMP broker.
#[derive(Parser, Debug)]
#[command(name = "stomp-output")]
#[command(about = "Publish newline-delimited events to a STOMP broker in transactions")]
struct Args {
    /// JSON configuration file. Flags override its values.
    #[arg(long, env = "STOMP_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host.
    #[arg(long)]
    host: Option<String>,

    /// Broker port.
    #[arg(long)]
    port: Option<u16>,

    /// Login.
    #[arg(long)]
    user: Option<String>,

    /// Passcode.
    #[arg(long, env = "STOMP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Destination template, e.g. `/topic/%{host}`.
    #[arg(long)]
    destination: Option<String>,

    /// Virtual host sent in CONNECT.
    #[arg(long)]
    vhost: Option<String>,

    /// Extra SEND header as `name=template`. Repeatable.
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Log every frame sent and received.
    #[arg(long)]
    debug: bool,

    /// Events per transaction.
    #[arg(long, default_value = "125")]
    batch_size: usize,

    /// Flush a partial batch after this many milliseconds.
    #[arg(long, default_value = "1000")]
    flush_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, template)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), template.to_string()))
        }
        _ => Err(format!("expected name=template, got '{}'", raw)),
    }
}

fn build_config(args: &Args) -> StompResult<StompOutputConfig> {
    let mut config = match &args.config {
        Some(path) => StompOutputConfig::load(path)?,
        None => {
            let mut config = StompOutputConfig::default();
            config.load_from_env();
            config
        }
    };
    apply_args(&mut config, args);
    config.validate()?;
    Ok(config)
}

/// Layer command-line flags over a loaded configuration.
fn apply_args(config: &mut StompOutputConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(password) = &args.password {
        config.password = stomp_output::Secret::new(password.clone());
    }
    if let Some(destination) = &args.destination {
        config.destination = destination.clone();
    }
    if let Some(vhost) = &args.vhost {
        config.vhost = Some(vhost.clone());
    }
    for (name, template) in &args.headers {
        config.set_header(name.as_str(), template.as_str());
    }
    config.debug |= args.debug;
}

async fn flush(output: &StompOutput, batch: &mut Vec<JsonEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    match output.multi_receive(&events).await {
        Ok(handle) => {
            tokio::spawn(async move {
                let outcome = handle.completion().await;
                if !outcome.is_success() {
                    warn!(
                        transaction = %outcome.transaction,
                        acknowledged = outcome.acknowledged,
                        failed = outcome.failed.len(),
                        "Batch partially failed"
                    );
                }
            });
        }
        Err(e) => error!(events = events.len(), error = %e, "Batch failed"),
    }
}

/// Read stdin until EOF or Ctrl-C, publishing as batches fill up.
async fn pump(output: &StompOutput, batch_size: usize, flush_interval: Duration) -> StompResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    batch.push(JsonEvent::from_line(&line));
                    if batch.len() >= batch_size {
                        flush(output, &mut batch).await;
                    }
                }
                None => {
                    info!("End of input");
                    break;
                }
            },
            _ = ticker.tick() => flush(output, &mut batch).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    flush(output, &mut batch).await;
    Ok(())
}

#[tokio::main]
async fn main() -> StompResult<()> {
    let args = Args::parse();

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| default_level(args.debug).to_string());
    init_logging(&level, args.json_logs);

    let config = build_config(&args)?;
    if args.batch_size == 0 {
        return Err(StompError::Config("batch-size must be at least 1".to_string()));
    }

    info!(
        host = %config.host,
        port = config.port,
        destination = %config.destination,
        batch_size = args.batch_size,
        "stomp-output starting"
    );

    let output = tokio::select! {
        output = StompOutput::register(config) => output?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal before connecting");
            return Ok(());
        }
    };

    let pumped = pump(
        &output,
        args.batch_size,
        Duration::from_millis(args.flush_interval_ms.max(1)),
    )
    .await;
    if let Err(e) = &pumped {
        error!(error = %e, "Reading input failed");
    }

    output.close().await?;
    pumped
}
