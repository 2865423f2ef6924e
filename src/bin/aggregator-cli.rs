#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for the inbox aggregator core

use clap::{Parser, Subcommand};
use inbox_aggregator::{AggregatorSettings, Provider, Service, Viewer, load_registry_from_env};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aggregator-cli")]
#[command(about = "Query and control the multi-tenant inbox aggregator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the recent-window inbox view for a recipient address
    Fetch {
        /// Recipient address, e.g. a registered account or a generated alias
        address: String,

        /// Bypass the view cache and force a fresh fetch
        #[arg(long)]
        refresh: bool,

        /// Fetch as an authenticated viewer instead of an anonymous one
        #[arg(long)]
        authenticated: bool,
    },

    /// Fetch and merge the recent window across every registered account
    FetchAll,

    /// Delete a message by backend address and UID
    Delete {
        /// Address of the physical backend mailbox
        backend: String,
        uid: u32,
    },

    /// Generate a new alias for a registered account
    Alias {
        /// gmail or outlook
        provider: String,
        /// The account to alias
        base: String,
        /// Custom suffix (e.g. "shop"); random if omitted
        #[arg(long)]
        suffix: Option<String>,
        /// Use Gmail's dot-variant instead of a plus-alias
        #[arg(long)]
        dot: bool,
    },

    /// List every registered account
    Accounts,

    /// Print cache/backend health
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let registry = load_registry_from_env()?;
    let account_count = registry.list_accounts().len();
    let settings = if account_count > 1 {
        AggregatorSettings::aggregated()
    } else {
        AggregatorSettings::single_account()
    }
    .with_env_overrides();

    let service = Service::new(registry, settings);

    match &args.command {
        Command::Fetch {
            address,
            refresh,
            authenticated,
        } => {
            let viewer = if *authenticated {
                Viewer::Authenticated
            } else {
                Viewer::Anonymous
            };
            let messages = if *refresh {
                service.refresh_address(address, viewer).await
            } else {
                service.fetch_for_address(address, viewer).await
            };
            print_messages(&messages, args.json)?;
        }
        Command::FetchAll => {
            let messages = service.fetch_all_aggregated().await;
            print_messages(&messages, args.json)?;
        }
        Command::Delete { backend, uid } => {
            let ok = service.delete_message(backend, *uid).await;
            if args.json {
                println!("{}", serde_json::json!({ "deleted": ok }));
            } else if ok {
                println!("deleted {backend} UID {uid}");
            } else {
                println!("failed to delete {backend} UID {uid}");
            }
        }
        Command::Alias {
            provider,
            base,
            suffix,
            dot,
        } => {
            let provider = parse_provider(provider)?;
            let alias = service.generate_alias(provider, base, suffix.as_deref(), *dot)?;
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "alias": alias.alias_address, "base": alias.base_address })
                );
            } else {
                println!("{}", alias.alias_address);
            }
        }
        Command::Accounts => {
            let accounts = service.list_accounts_for_viewer();
            if args.json {
                let addresses: Vec<&str> = accounts.iter().map(|a| a.address.as_str()).collect();
                println!("{}", serde_json::to_string_pretty(&addresses)?);
            } else {
                for account in &accounts {
                    println!("{} ({})", account.address, account.provider);
                }
            }
        }
        Command::Stats => {
            let stats = service.stats().await;
            println!(
                "view_cache={} message_store={} payload_cache={}",
                stats.view_cache_len, stats.message_store_len, stats.payload_cache_len
            );
            for backend in &stats.backends {
                println!(
                    "  {} cooling_down={}",
                    backend.address, backend.cooling_down
                );
            }
        }
    }

    service.shutdown();
    Ok(())
}

fn parse_provider(s: &str) -> anyhow::Result<Provider> {
    match s.to_lowercase().as_str() {
        "gmail" => Ok(Provider::Gmail),
        "outlook" | "hotmail" => Ok(Provider::Outlook),
        other => anyhow::bail!("unknown provider '{other}', expected gmail or outlook"),
    }
}

fn print_messages(messages: &[inbox_aggregator::Message], json: bool) -> anyhow::Result<()> {
    if json {
        let rows: Vec<_> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "uid": m.uid,
                    "backend": m.backend,
                    "from": m.from,
                    "to": m.to,
                    "subject": m.subject,
                    "date": m.date.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if messages.is_empty() {
        println!("No messages found.");
        return Ok(());
    }

    println!("{:<8} {:<22} {:<28} {}", "UID", "Date", "From", "Subject");
    println!("{}", "-".repeat(100));
    for m in messages {
        println!(
            "{:<8} {:<22} {:<28} {}",
            m.uid,
            m.date.format("%Y-%m-%d %H:%M"),
            truncate(&m.from, 26),
            truncate(&m.subject, 40),
        );
    }
    println!("\n{} message(s)", messages.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max.saturating_sub(3)).collect::<String>())
    }
}
