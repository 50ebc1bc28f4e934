//! `redmq` command line: run the embedded list store and inspect queues.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use redmq_core::{queue_name, Envelope, QueueRole};
use redmq_server::{storage, ConnectionConfig, ConnectionPool, ListStore, MqClient, PoolConfig};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "redmq", version, about = "Message queues over Redis lists")]
struct Cli {
    /// Store address for client commands.
    #[arg(long, env = "REDMQ_ADDR", default_value = "127.0.0.1:6379", global = true)]
    addr: String,

    /// Password sent with AUTH; for `store`, the password clients must send.
    #[arg(long, env = "REDMQ_PASSWORD", global = true)]
    password: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the in-memory list store over TCP until Ctrl-C.
    Store {
        #[arg(long, default_value = "127.0.0.1:6379")]
        listen: String,
    },
    /// Publish one message to a type's work queue.
    Publish {
        type_name: String,
        body: String,
        /// Route to the priority queue.
        #[arg(long)]
        priority: bool,
        /// Queue the worker should reply to.
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Show queue lengths for one or more types.
    Depth {
        #[arg(required = true)]
        type_names: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Move every dead letter of a type back to work, resetting its retry count.
    DrainDlq { type_name: String },
}

fn init_tracing(json: bool) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "redmq_server=info,redmq=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn client(cli: &Cli) -> MqClient {
    let config = PoolConfig {
        connection: ConnectionConfig {
            password: cli.password.clone(),
            ..ConnectionConfig::default()
        },
        ..PoolConfig::default()
    };
    MqClient::new(ConnectionPool::tcp(cli.addr.clone(), config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Store { listen } => {
            let store = match &cli.password {
                Some(password) => ListStore::with_password(password.clone()),
                None => ListStore::new(),
            };
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("binding {listen}"))?;
            storage::serve(listener, Arc::new(store), async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
            })
            .await?;
        }
        Commands::Publish {
            type_name,
            body,
            priority,
            reply_to,
        } => {
            let mut envelope = Envelope::new(body.as_bytes());
            if *priority {
                envelope = envelope.with_priority(1);
            }
            if let Some(queue) = reply_to {
                envelope = envelope.with_reply_to(queue.clone());
            }
            client(&cli).publish(type_name, &envelope).await?;
            println!("{}", envelope.id);
        }
        Commands::Depth { type_names, json } => {
            let client = client(&cli);
            let mut depths = Vec::with_capacity(type_names.len());
            for type_name in type_names {
                depths.push(client.queue_depths(type_name).await?);
            }
            if *json {
                println!("{}", serde_json::to_string_pretty(&depths)?);
            } else {
                println!("{:<24} {:>8} {:>8} {:>8} {:>8}", "TYPE", "INQ", "PRIO", "OUTQ", "DLQ");
                for d in &depths {
                    println!(
                        "{:<24} {:>8} {:>8} {:>8} {:>8}",
                        d.type_name, d.inbound, d.priority, d.outbound, d.dead_letter
                    );
                }
            }
        }
        Commands::DrainDlq { type_name } => {
            let from = queue_name(type_name, QueueRole::DeadLetter)?;
            let replayed = client(&cli).replay_dead_letters(type_name).await?;
            println!("replayed {replayed} message(s) from {from}");
        }
    }
    Ok(())
}
