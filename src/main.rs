//! Burrow relay - quota-metered TCP/UDP tunnels for hosts behind NAT
//!
//! Runs the relay by default; `burrow key ...` administers the key store.

use anyhow::{bail, Context, Result};
use burrow_lib::{
    format_expire, open_key_store, parse_expire, KeyRecord, KeyStore, PortPolicy, RelayBuilder,
    RelayConfig,
};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - expose services behind NAT through a metered relay
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose services behind NAT through a metered relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Key store database
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "sqlite://./burrow.db?mode=rwc"
    )]
    database_url: String,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage quota keys
    #[command(subcommand)]
    Key(KeyCommand),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address hosts connect their control channel to
    #[arg(long, env = "BURROW_CONTROL_ADDR", default_value = "0.0.0.0:44801")]
    control_addr: SocketAddr,

    /// Address hosts dial back data channels to
    #[arg(long, env = "BURROW_TRANSFER_ADDR", default_value = "0.0.0.0:44802")]
    transfer_addr: SocketAddr,

    /// Host name announced to hosts in the connect line
    #[arg(long, env = "BURROW_PUBLIC_HOST", default_value = "localhost")]
    public_host: String,

    /// Address public ports are bound on
    #[arg(long, env = "BURROW_BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Host version allowed to connect (repeatable; defaults to this relay's version)
    #[arg(long = "accept-version", value_name = "VERSION")]
    accepted_versions: Vec<String>,

    /// Accept hosts of any version
    #[arg(long, conflicts_with = "accepted_versions")]
    any_version: bool,

    /// Seconds without a ping before a session is dropped
    #[arg(long, default_value = "60")]
    heartbeat_timeout: u64,

    /// Seconds a forwarder waits for the host to dial back
    #[arg(long, default_value = "10")]
    rendezvous_timeout: u64,

    /// Seconds between writes of key balances to the store
    #[arg(long, default_value = "30")]
    flush_interval: u64,

    /// Seconds before an idle UDP peer is forgotten
    #[arg(long, default_value = "60")]
    udp_idle_timeout: u64,

    /// Datagrams queued per UDP peer before new ones are dropped
    #[arg(long, default_value = "100")]
    udp_queue: usize,

    /// Banned IP or CIDR range (repeatable or comma separated)
    #[arg(long = "ban", env = "BURROW_BANNED", value_delimiter = ',')]
    banned: Vec<String>,

    /// Body of the 403 sent in place of blocked HTML pages
    #[arg(long, env = "BURROW_FORBIDDEN_HTML_MESSAGE")]
    forbidden_html_message: Option<String>,

    /// Log forwarding I/O errors as warnings
    #[arg(long)]
    debug: bool,
}

impl ServeArgs {
    fn into_config(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        let accepted_versions = if self.any_version {
            Vec::new()
        } else if self.accepted_versions.is_empty() {
            defaults.accepted_versions.clone()
        } else {
            self.accepted_versions
        };

        RelayConfig {
            control_addr: self.control_addr,
            transfer_addr: self.transfer_addr,
            public_host: self.public_host,
            bind_ip: self.bind_ip,
            accepted_versions,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            rendezvous_timeout: Duration::from_secs(self.rendezvous_timeout),
            flush_interval: Duration::from_secs(self.flush_interval),
            udp_idle_timeout: Duration::from_secs(self.udp_idle_timeout),
            udp_queue_capacity: self.udp_queue,
            forbidden_html_message: self
                .forbidden_html_message
                .unwrap_or(defaults.forbidden_html_message.clone()),
            banned: self.banned,
            debug: self.debug,
            ..defaults
        }
    }
}

#[derive(Subcommand, Debug)]
enum KeyCommand {
    /// Create a key
    Create {
        name: String,

        /// Initial quota in MiB
        #[arg(long)]
        balance: f64,

        /// Rate limit in Mbps (0 = unlimited)
        #[arg(long, default_value = "0")]
        rate: f64,

        /// Expiry as YYYY/MM/DD-HH:MM (relay local time)
        #[arg(long)]
        expires: String,

        /// Public port or range, e.g. 5000 or 5000-5100
        #[arg(long)]
        port: String,

        /// Refuse to forward HTML pages
        #[arg(long)]
        no_html: bool,
    },
    /// Show one key
    Show { name: String },
    /// List all keys
    List,
    /// Add quota to a key
    TopUp {
        name: String,
        /// MiB to add
        mib: f64,
    },
    /// Allow a key to connect again
    Enable { name: String },
    /// Stop a key from connecting; live sessions end on the next check
    Disable { name: String },
    /// Remove a key
    Delete { name: String },
}

/// Setup logging with the specified log level
fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn print_key(record: &KeyRecord) {
    println!("{}", record.name);
    println!("  balance:  {:.2} MiB", record.balance);
    if record.rate > 0.0 {
        println!("  rate:     {} Mbps", record.rate);
    } else {
        println!("  rate:     unlimited");
    }
    println!("  expires:  {}", format_expire(&record.expire_at));
    println!("  port:     {}", record.port);
    println!("  enabled:  {}", record.enabled);
    println!("  html:     {}", record.html_enabled);
}

async fn load_key(store: &Arc<dyn KeyStore>, name: &str) -> Result<KeyRecord> {
    match store.load(name).await? {
        Some(record) => Ok(record),
        None => bail!("key {} does not exist", name),
    }
}

async fn run_key_command(store: Arc<dyn KeyStore>, command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::Create {
            name,
            balance,
            rate,
            expires,
            port,
            no_html,
        } => {
            if store.exists(&name).await? {
                bail!("key {} already exists", name);
            }
            if balance < 0.0 || rate < 0.0 {
                bail!("balance and rate must not be negative");
            }
            let record = KeyRecord {
                name,
                balance,
                rate,
                expire_at: parse_expire(&expires)?,
                port: port.parse::<PortPolicy>()?,
                enabled: true,
                html_enabled: !no_html,
            };
            store.save(&record).await?;
            print_key(&record);
        }
        KeyCommand::Show { name } => print_key(&load_key(&store, &name).await?),
        KeyCommand::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No keys");
            }
            for record in records {
                println!(
                    "{:<24} {:>12.2} MiB  {}  port {}  {}",
                    record.name,
                    record.balance,
                    format_expire(&record.expire_at),
                    record.port,
                    if record.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        KeyCommand::TopUp { name, mib } => {
            if mib <= 0.0 {
                bail!("top-up amount must be positive");
            }
            let mut record = load_key(&store, &name).await?;
            record.balance += mib;
            store.save(&record).await?;
            println!("{}: {:.2} MiB", record.name, record.balance);
        }
        KeyCommand::Enable { name } => {
            if !store.set_enabled(&name, true).await? {
                bail!("key {} does not exist", name);
            }
            println!("{} enabled", name);
        }
        KeyCommand::Disable { name } => {
            if !store.set_enabled(&name, false).await? {
                bail!("key {} does not exist", name);
            }
            println!("{} disabled", name);
        }
        KeyCommand::Delete { name } => {
            if !store.delete(&name).await? {
                bail!("key {} does not exist", name);
            }
            println!("{} deleted", name);
        }
    }
    Ok(())
}

async fn serve(store: Arc<dyn KeyStore>, args: ServeArgs) -> Result<()> {
    let relay = RelayBuilder::new()
        .config(args.into_config())
        .key_store(store)
        .build()
        .context("Invalid relay configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    relay.run(shutdown).await?;
    info!("Burrow stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = open_key_store(&cli.database_url)
        .await
        .with_context(|| format!("Failed to open key store {}", cli.database_url))?;

    match cli.command {
        Some(Commands::Key(command)) => run_key_command(store, command).await,
        None => {
            info!("Burrow {} starting...", env!("GIT_TAG"));
            serve(store, cli.serve).await
        }
    }
}
