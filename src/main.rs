//! sublink CLI - keeps one Redis subscription alive for a host process.
//!
//! `sublink run` reads JSON commands from stdin, one per line, and writes
//! events to stdout as JSON lines. Logs go to stderr. See the `sublink`
//! library for the core functionality.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use sublink::transport::publish_once;
use sublink::{
    ChannelNotifier, Command, CommandDispatcher, Config, ConnectionManager, Endpoint, Event,
    RedisTransport,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Pending commands between the stdin reader and the dispatcher.
const COMMAND_BUFFER: usize = 64;

/// How long shutdown waits for queued events to reach stdout.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// CLI
#[derive(Parser)]
#[command(name = "sublink")]
#[command(version)]
#[command(about = "Keeps a single Redis pub/sub subscription alive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read commands from stdin and stream events to stdout
    Run {
        /// Broker host for the initial CONNECT
        #[arg(long)]
        host: Option<String>,
        /// Broker port for the initial CONNECT
        #[arg(long)]
        port: Option<u16>,
        /// Channel to subscribe to on startup
        #[arg(long)]
        channel: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file as well
        #[arg(long)]
        save: bool,
    },
    /// Publish one message and exit
    Send {
        /// Channel to publish on
        #[arg(long)]
        channel: String,
        /// Message payload
        #[arg(long)]
        data: Option<String>,
        /// Broker host (defaults to configured host)
        #[arg(long)]
        host: Option<String>,
        /// Broker port (defaults to configured port)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn endpoint_or_default(config: &Config, host: Option<String>, port: Option<u16>) -> Endpoint {
    let default = config.default_endpoint();
    Endpoint::new(host.unwrap_or(default.host), port.unwrap_or(default.port))
}

/// Runs the command loop until stdin closes or Ctrl-C.
async fn run(config: Config, initial: Option<Command>) -> Result<()> {
    let (notifier, mut events) = ChannelNotifier::channel();
    let manager = ConnectionManager::new(
        config.timings(),
        config.default_endpoint(),
        Arc::new(RedisTransport::new(config.connect_timeout())),
        Arc::new(notifier),
    );
    let dispatcher = CommandDispatcher::new(manager.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            if let Err(e) = write_event(&mut stdout, &event).await {
                log::error!("Failed to write event: {}", e);
                break;
            }
        }
    });

    if let Some(command) = initial {
        cmd_tx.send(command).await.context("Dispatcher stopped")?;
    }

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match Command::parse_json(&line) {
                    Ok(command) => {
                        if cmd_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("{:#}", e),
                },
                Ok(None) => {
                    log::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    log::info!("sublink v{} started", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        () = dispatcher.run(cmd_rx) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            log::info!("Interrupted");
        }
    }

    reader.abort();
    manager.shutdown().await;
    // Dropping the last notifier closes the event stream and ends the writer.
    drop(dispatcher);
    drop(manager);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Event writer ended abnormally: {}", e),
        Err(_) => log::warn!("Event writer still busy after {:?}", WRITER_DRAIN_TIMEOUT),
    }
    Ok(())
}

async fn write_event(stdout: &mut tokio::io::Stdout, event: &Event) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

async fn send_once(config: &Config, endpoint: Endpoint, channel: &str, data: &str) -> Result<()> {
    let transport = RedisTransport::new(config.connect_timeout());
    publish_once(&transport, &endpoint, channel, data)
        .await
        .with_context(|| format!("Failed to publish on {channel} via {endpoint}"))?;
    println!("Published to {} via {}", channel, endpoint);
    Ok(())
}

fn main() -> Result<()> {
    // stdout carries the event stream, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    match cli.command {
        Commands::Run {
            host,
            port,
            channel,
        } => {
            let initial = channel.map(|channel| {
                let endpoint = endpoint_or_default(&config, host, port);
                Command::connect(endpoint.host, endpoint.port, channel)
            });
            runtime.block_on(run(config, initial))?;
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                eprintln!("Saved to {}", path.display());
            }
        }
        Commands::Send {
            channel,
            data,
            host,
            port,
        } => {
            let endpoint = endpoint_or_default(&config, host, port);
            let data = data.unwrap_or_else(|| sublink::constants::NO_DATA_PLACEHOLDER.to_string());
            runtime.block_on(send_once(&config, endpoint, &channel, &data))?;
        }
    }

    Ok(())
}
