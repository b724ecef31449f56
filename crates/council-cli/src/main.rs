//! `council` command-line client.
//!
//! Usage:
//!   council status --session brave-blue-fox
//!   council status --session brave-blue-fox --after 12 --await --participant Alice
//!   echo "Agreed." | council post --session brave-blue-fox --next Bob
//!   council watch --session brave-blue-fox
//!
//! The server comes from `--server`, then `COUNCIL_SERVER`, then
//! `~/.config/council/client.ron`, then `http://localhost:3000`.

mod render;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use council_client::constants::DEFAULT_AWAIT_TIMEOUT;
use council_client::{
    ClientConfig, HttpRemote, RemoteLog, SessionClient, SessionSnapshot, connect_http,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Client for council multi-participant discussion sessions.
#[derive(Parser, Debug)]
#[command(name = "council")]
#[command(about = "Follow and post to council sessions")]
struct Args {
    /// Server base URL
    #[arg(long, global = true, env = "COUNCIL_SERVER")]
    server: Option<String>,

    /// Config file (defaults to ~/.config/council/client.ron)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the session transcript
    Status {
        #[arg(long)]
        session: String,

        /// Only show events after event number N
        #[arg(long, default_value_t = 0)]
        after: u64,

        /// Block until there are new events and it's your turn
        #[arg(long = "await", requires = "participant")]
        wait: bool,

        /// Your participant name (required with --await)
        #[arg(short, long)]
        participant: Option<String>,

        /// Seconds to wait with --await
        #[arg(long, default_value_t = DEFAULT_AWAIT_TIMEOUT.as_secs())]
        timeout: u64,
    },

    /// Post a message as the moderator (content from --file or stdin)
    Post {
        #[arg(long)]
        session: String,

        /// Participant who should speak next
        #[arg(long)]
        next: Option<String>,

        /// Read the message from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Follow the session, printing events as they arrive
    Watch {
        #[arg(long)]
        session: String,
    },

    /// List active participants
    Participants {
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Transcripts go to stdout; logs stay on stderr.
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Status {
            session,
            after,
            wait,
            participant,
            timeout,
        } => match participant.filter(|_| wait) {
            Some(participant) => await_turn(&config, &session, &participant, after, timeout).await,
            None => status(&config, &session, after).await,
        },
        Command::Post { session, next, file } => {
            post(&config, &session, next.as_deref(), file).await
        }
        Command::Watch { session } => watch(&config, &session).await,
        Command::Participants { session } => participants(&config, &session).await,
    }
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ClientConfig::load_default().context("loading client config")?,
    };
    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    Ok(config)
}

async fn open(config: &ClientConfig, session: &str) -> Result<(SessionClient, SessionSnapshot)> {
    let client = connect_http(config, session)
        .with_context(|| format!("invalid server URL '{}'", config.server))?;
    let snap = client.engine.wait_settled().await?;
    Ok((client, snap))
}

async fn status(config: &ClientConfig, session: &str, after: u64) -> Result<()> {
    let (_client, snap) = open(config, session).await?;
    print!("{}", render::transcript(&snap, after));
    Ok(())
}

async fn await_turn(
    config: &ClientConfig,
    session: &str,
    participant: &str,
    after: u64,
    timeout: u64,
) -> Result<()> {
    let (client, _) = open(config, session).await?;
    info!(participant, after, timeout, "waiting for turn");

    match client
        .engine
        .wait_for_turn(participant, after, Duration::from_secs(timeout))
        .await?
    {
        Some(snap) => {
            print!("{}", render::transcript(&snap, after));
            Ok(())
        }
        None => bail!("timeout waiting for turn after {timeout} seconds"),
    }
}

async fn post(
    config: &ClientConfig,
    session: &str,
    next: Option<&str>,
    file: Option<PathBuf>,
) -> Result<()> {
    let content = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        }
    };

    let (client, snap) = open(config, session).await?;
    match client.post.submit(&content, next).await {
        Ok(outcome) => {
            println!("Posted #{}", outcome.event_number);
            Ok(())
        }
        Err(e) if e.is_stale() => {
            let latest = client.engine.snapshot();
            eprintln!("New messages arrived. Please review before posting.");
            print!("{}", render::events(latest.events_after(snap.cursor)));
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(config: &ClientConfig, session: &str) -> Result<()> {
    let (client, snap) = open(config, session).await?;
    print!("{}", render::transcript(&snap, 0));
    flush();

    let mut rx = client.engine.subscribe();
    let mut printed = snap.cursor;
    let mut last_error = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = rx.borrow_and_update().clone();
                if snap.cursor > printed {
                    print!("{}", render::events(snap.events_after(printed)));
                    flush();
                    printed = snap.cursor;
                }
                if snap.last_error != last_error {
                    if let Some(e) = &snap.last_error {
                        warn!("sync error: {e}");
                    }
                    last_error = snap.last_error.clone();
                }
                if snap.phase.is_terminal() {
                    bail!("session '{}' is no longer available", snap.session_id);
                }
            }
        }
    }

    info!("watch stopped");
    Ok(())
}

async fn participants(config: &ClientConfig, session: &str) -> Result<()> {
    let remote = HttpRemote::new(&config.server)
        .with_context(|| format!("invalid server URL '{}'", config.server))?;

    let names = remote.participants(session).await?;
    if names.is_empty() {
        println!("(none)");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn flush() {
    let _ = std::io::stdout().flush();
}
