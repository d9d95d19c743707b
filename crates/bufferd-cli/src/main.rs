//! bufferd control CLI
//!
//! Queries and manipulates the buffers of a running bufferd daemon.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bufferd_rpc::{ClientEndpoint, CommunicationSettings, ValueChangeObserver};
use bufferd_types::{BufferConfiguration, SimpleData};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// bufferd control CLI
#[derive(Parser)]
#[command(name = "bufferctl")]
#[command(about = "Query and control the buffers of a bufferd daemon")]
#[command(version)]
#[command(after_help = "\
Examples:
  bufferctl list                    List all buffers
  bufferctl list '^A'               List buffers whose name starts with A
  bufferctl find unit volt          Buffers with a unit metainfo matching volt
  bufferctl get AI                  Current value of AI
  bufferctl set AO 4.2              Write 4.2 to the actor AO
  bufferctl watch AI                Print every change of AI until Ctrl-C
  bufferctl create doubled '{\"buffer\":{\"type\":\"SENSOR\"},\"gatherer\":{\"type\":\"SENSOR\",\"name\":\"AI\"},\"adapter\":[{\"type\":\"SCALE\",\"a\":0,\"b\":2,\"c\":0}],\"metainfo\":[]}'

The daemon address is taken from BUFFERD_DAEMON_ADDRESS and BUFFERD_DAEMON_PORT.
")]
struct Cli {
    /// Daemon port, overriding `$BUFFERD_DAEMON_PORT`
    #[arg(long, global = true, value_name = "PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List buffers whose name matches a regex
    List {
        /// Case-insensitive regex
        #[arg(default_value = ".*")]
        pattern: String,
    },

    /// List buffers with a matching metainfo entry
    Find {
        /// Regex for the metainfo topic
        topic: String,
        /// Regex for the metainfo value
        metainfo: String,
    },

    /// Show whether a buffer is hardware and its metainfo
    Info { name: String },

    /// Print a buffer's configuration as JSON
    Config { name: String },

    /// Print a buffer's current value
    Get { name: String },

    /// Write a value to an actor buffer
    Set {
        name: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },

    /// Print every change of a buffer until interrupted
    Watch { name: String },

    /// Create or replace a buffer from a JSON configuration
    Create {
        name: String,
        /// Configuration in wire form
        configuration: String,
        /// Only reconfigure an existing buffer
        #[arg(long)]
        existing: bool,
    },

    /// Remove a buffer
    Release { name: String },

    /// Shutdown the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bufferd=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = CommunicationSettings::from_env();
    if let Some(port) = cli.port {
        settings.port = port;
    }
    let client = ClientEndpoint::new(settings);

    let result = run(&client, cli.command).await;
    client.disconnect().await;
    result
}

async fn run(client: &ClientEndpoint, command: Commands) -> Result<()> {
    match command {
        Commands::List { pattern } => {
            let names = client
                .query_buffers_by_name(&pattern)
                .await
                .with_context(|| daemon_hint(client))?;
            print_names(names);
        }
        Commands::Find { topic, metainfo } => {
            let names = client
                .query_buffers_by_metainfo(&topic, &metainfo)
                .await
                .with_context(|| daemon_hint(client))?;
            print_names(names);
        }
        Commands::Info { name } => {
            let Some(description) = client
                .buffer_metainfo(&name)
                .await
                .with_context(|| daemon_hint(client))?
            else {
                bail!("Unknown buffer: {name}");
            };
            println!("Name:     {}", description.name);
            println!("Hardware: {}", description.is_hardware);
            for (topic, value) in &description.metainfo {
                println!("  {topic}: {value}");
            }
        }
        Commands::Config { name } => {
            let Some(configuration) = client
                .buffer_configuration(&name)
                .await
                .with_context(|| daemon_hint(client))?
            else {
                bail!("Unknown buffer: {name}");
            };
            println!("{}", serde_json::to_string_pretty(&configuration)?);
        }
        Commands::Get { name } => {
            let Some(value) = client
                .get_immediate(&name)
                .await
                .with_context(|| daemon_hint(client))?
            else {
                bail!("Unknown buffer: {name}");
            };
            println!("{value}");
        }
        Commands::Set { name, value } => {
            let Some(current) = client
                .set(&name, value)
                .await
                .with_context(|| daemon_hint(client))?
            else {
                bail!("Unknown actor: {name}");
            };
            println!("{current}");
        }
        Commands::Watch { name } => watch(client, &name).await?,
        Commands::Create {
            name,
            configuration,
            existing,
        } => {
            let configuration: BufferConfiguration =
                serde_json::from_str(&configuration).context("Invalid configuration JSON")?;
            let accepted = client
                .set_buffer_configuration(&name, &configuration, !existing)
                .await
                .with_context(|| daemon_hint(client))?;
            if !accepted {
                bail!("Daemon refused the configuration of {name}");
            }
            println!("Configured {name}");
        }
        Commands::Release { name } => {
            let released = client
                .release_buffer(&name)
                .await
                .with_context(|| daemon_hint(client))?;
            if !released {
                bail!("Daemon refused to release {name}");
            }
            println!("Released {name}");
        }
        Commands::Shutdown => {
            client
                .shutdown_daemon()
                .await
                .with_context(|| daemon_hint(client))?;
            println!("Daemon shutdown requested");
        }
    }
    Ok(())
}

fn daemon_hint(client: &ClientEndpoint) -> String {
    format!(
        "Failed to talk to the daemon at {}. Is it running?",
        client.settings().socket_addr()
    )
}

fn print_names(names: impl IntoIterator<Item = String>) {
    for name in names {
        println!("{name}");
    }
}

/// Forwards pushes to the watch loop; `None` means the daemon went away.
struct WatchObserver {
    events: mpsc::UnboundedSender<Option<SimpleData>>,
}

impl ValueChangeObserver for WatchObserver {
    fn value_changed(&self, value: &SimpleData) {
        let _ = self.events.send(Some(value.clone()));
    }

    fn communication_lost(&self) {
        let _ = self.events.send(None);
    }
}

async fn watch(client: &ClientEndpoint, name: &str) -> Result<()> {
    let Some(current) = client
        .get_immediate(name)
        .await
        .with_context(|| daemon_hint(client))?
    else {
        bail!("Unknown buffer: {name}");
    };
    println!("{current}");

    let (events, mut received) = mpsc::unbounded_channel();
    let observer = client.add_observer(Arc::new(WatchObserver { events }));

    let outcome = loop {
        if let Err(e) = client.get(name).await {
            break Err(anyhow::Error::new(e).context(daemon_hint(client)));
        }
        let event = tokio::select! {
            event = received.recv() => event,
            _ = tokio::signal::ctrl_c() => break Ok(()),
        };
        match event {
            Some(Some(value)) if value.buffer_name() == name => println!("{value}"),
            Some(Some(_)) => {}
            Some(None) | None => break Err(anyhow::anyhow!("Connection to the daemon lost")),
        }
    };

    client.remove_observer(observer).await;
    outcome
}
