use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nostr::{EventTemplate, Filter, Keys, Report, ReportReason, ReportTargetKind, unix_now};
use nostr_mux::{MuxConfig, NostrMux, SignerSetup, parse_relays};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nostr-mux")]
#[command(about = "Nostr relay pool and subscription multiplexer")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay to use instead of the configured list (repeatable)
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the relay list after normalization
    Relays {
        /// Entries to normalize instead of the configured list
        entries: Vec<String>,
    },
    /// Generate a fresh key pair
    Keygen,
    /// Stream matching events as JSON lines
    Watch {
        #[arg(long = "kind")]
        kinds: Vec<u16>,
        #[arg(long = "author")]
        authors: Vec<String>,
        #[arg(long)]
        limit: Option<u64>,
        /// Exit after this many events
        #[arg(long)]
        max_events: Option<usize>,
    },
    /// Sign and publish a note
    Publish {
        #[arg(long)]
        content: String,
        #[arg(long, default_value_t = 1)]
        kind: u16,
        #[command(flatten)]
        signer: SignerArgs,
    },
    /// Sign and submit a moderation report
    Report {
        /// Event id or pubkey being reported
        #[arg(long)]
        target: String,
        /// event | profile
        #[arg(long, default_value = "event")]
        target_kind: String,
        /// nudity | malware | profanity | illegal | spam | impersonation | other
        #[arg(long)]
        reason: String,
        #[arg(long)]
        details: Option<String>,
        #[command(flatten)]
        signer: SignerArgs,
    },
}

#[derive(clap::Args, Debug)]
struct SignerArgs {
    /// File holding an nsec, hex secret key or mnemonic
    #[arg(long, conflicts_with = "remote_signer")]
    key_file: Option<PathBuf>,
    /// Hex pubkey of a remote signer to delegate to
    #[arg(long)]
    remote_signer: Option<String>,
}

impl SignerArgs {
    fn setup(&self) -> Result<SignerSetup> {
        match (&self.key_file, &self.remote_signer) {
            (Some(path), _) => Ok(SignerSetup::Local(nostr::load_keys_from_path(path)?)),
            (None, Some(signer_pubkey)) => Ok(SignerSetup::Remote {
                signer_pubkey: signer_pubkey.clone(),
                client_keys: None,
            }),
            (None, None) => bail!("either --key-file or --remote-signer is required"),
        }
    }
}

fn parse_enum<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .with_context(|| format!("unknown {what}: {raw}"))
}

fn load_config(cli: &Cli) -> Result<MuxConfig> {
    let mut config = MuxConfig::load_or_default(cli.config.as_deref())?;
    if !cli.relays.is_empty() {
        config = config.with_relays(&cli.relays);
    }
    if config.relays.is_empty() {
        bail!("no usable relays configured");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut out = std::io::stdout();

    match &cli.command {
        Commands::Relays { entries } => {
            let relays = if entries.is_empty() {
                load_config(&cli)?.relays
            } else {
                parse_relays(entries)
            };
            for relay in relays {
                writeln!(out, "{relay}")?;
            }
        }
        Commands::Keygen => {
            let keys = Keys::generate();
            writeln!(out, "pubkey: {}", keys.public_key_hex())?;
            writeln!(out, "npub:   {}", keys.npub()?)?;
            writeln!(out, "nsec:   {}", keys.nsec()?)?;
        }
        Commands::Watch {
            kinds,
            authors,
            limit,
            max_events,
        } => {
            let mux = NostrMux::start(load_config(&cli)?, SignerSetup::None).await?;
            let mut filter = Filter::new();
            if !kinds.is_empty() {
                filter = filter.kinds(kinds.iter().copied());
            }
            if !authors.is_empty() {
                filter = filter.authors(authors.iter().cloned());
            }
            if let Some(limit) = limit {
                filter = filter.limit(*limit);
            }
            let mut handle = mux.subscribe(vec![filter]).await?;
            let mut seen = 0usize;
            loop {
                tokio::select! {
                    event = handle.recv() => {
                        let Some(event) = event else { break };
                        writeln!(out, "{}", serde_json::to_string(&event)?)?;
                        out.flush()?;
                        seen += 1;
                        if max_events.is_some_and(|max| seen >= max) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            handle.close().await?;
            mux.shutdown().await;
        }
        Commands::Publish {
            content,
            kind,
            signer,
        } => {
            let mux = NostrMux::start(load_config(&cli)?, signer.setup()?).await?;
            let template = EventTemplate {
                created_at: unix_now(),
                kind: *kind,
                tags: Vec::new(),
                content: content.clone(),
            };
            let result = mux.sign_and_publish(&template).await;
            mux.shutdown().await;
            let (event, report) = result?;
            writeln!(out, "{}", event.id)?;
            for (relay, outcome) in &report.outcomes {
                writeln!(out, "  {relay}: {outcome:?}")?;
            }
        }
        Commands::Report {
            target,
            target_kind,
            reason,
            details,
            signer,
        } => {
            let target_kind: ReportTargetKind = parse_enum(target_kind, "target kind")?;
            let reason: ReportReason = parse_enum(reason, "report reason")?;
            let mux = NostrMux::start(load_config(&cli)?, signer.setup()?).await?;
            let reporter = mux
                .signer()
                .public_key()
                .context("no signer configured")?
                .to_string();
            let mut report = Report::new(target.clone(), target_kind, reason, reporter, unix_now());
            if let Some(details) = details {
                report = report.with_details(details.clone());
            }
            let result = mux.submit_report(&report).await;
            if let Ok(submitted) = &result {
                writeln!(out, "{}", submitted.event.id)?;
            }
            mux.shutdown().await;
            result?;
        }
    }
    Ok(())
}
