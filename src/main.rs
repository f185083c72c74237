use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bson::doc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use ruta::config::{Config, LoggingConfig};
use ruta::selection::read_preference::parse_tag_set;
use ruta::{Client, ClientOptions, NodeRole, ReadPreference, ReadPreferenceMode};

#[derive(Parser)]
#[command(name = "ruta")]
#[command(about = "Topology-aware MongoDB client core: discovery, monitoring and server selection")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Ruta Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where cluster settings come from. A URI wins over a file.
#[derive(clap::Args)]
struct Source {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Connection string, e.g. mongodb://a:27017,b:27017/?replicaSet=rs0
    #[arg(short, long)]
    uri: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the cluster and print its topology
    Discover {
        #[command(flatten)]
        source: Source,
        /// How long to wait for every seed to answer a heartbeat
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,
    },
    /// Select a node and ping it
    Ping {
        #[command(flatten)]
        source: Source,
        /// primary, primaryPreferred, secondary, secondaryPreferred or nearest
        #[arg(short, long, default_value = "primary")]
        read_preference: String,
        /// Tag set as name:value pairs, e.g. dc:east,rack:1 (repeatable, in order)
        #[arg(short, long)]
        tags: Vec<String>,
        /// Maximum replication lag in seconds
        #[arg(long)]
        max_staleness: Option<u64>,
    },
    /// Generate example configuration files
    Config {
        /// replica-set, sharded or standalone
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover { source, wait_ms } => {
            discover(source, Duration::from_millis(wait_ms)).await?;
        }
        Commands::Ping {
            source,
            read_preference,
            tags,
            max_staleness,
        } => {
            ping(source, &read_preference, &tags, max_staleness).await?;
        }
        Commands::Config { mode, output } => {
            generate_config(&mode, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn load_config(source: &Source) -> Result<Config> {
    match (&source.uri, &source.config) {
        (Some(uri), _) => Config::from_uri(uri).context("Invalid connection string"),
        (None, Some(path)) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        (None, None) => Ok(Config::default()),
    }
}

fn connect(source: &Source) -> Result<Client> {
    let config = load_config(source)?;
    init_logging(&config.logging)?;
    let options = ClientOptions::from_config(&config)?;
    info!(
        "Connecting to {} seed(s), replica set {:?}",
        options.seeds.len(),
        options.replica_set
    );
    Ok(Client::with_options(options)?)
}

async fn discover(source: Source, wait: Duration) -> Result<()> {
    let client = connect(&source)?;
    let description = client
        .topology()
        .wait_for(wait, |d| d.servers().all(|s| s.role != NodeRole::Unknown))
        .await
        .unwrap_or_else(|| client.description());

    println!("{}", description);
    for server in description.servers() {
        let rtt = server
            .round_trip_time
            .map(|rtt| format!("{:.1}ms", rtt.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "-".to_string());
        print!(
            "  {:<28} {:<14} rtt {:<8}",
            server.address.to_string(),
            server.role.as_str(),
            rtt
        );
        if !server.tags.is_empty() {
            let tags: Vec<String> = server.tags.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
            print!(" tags {}", tags.join(","));
        }
        if let Some(error) = &server.error {
            print!(" error: {}", error);
        }
        println!();
    }
    if let Some(error) = description.compatibility_error() {
        println!("incompatible: {}", error);
    }

    client.shutdown().await;
    Ok(())
}

async fn ping(
    source: Source,
    read_preference: &str,
    tags: &[String],
    max_staleness: Option<u64>,
) -> Result<()> {
    let mode: ReadPreferenceMode = read_preference.parse()?;
    let tag_sets = tags
        .iter()
        .map(|t| parse_tag_set(t))
        .collect::<Result<Vec<_>, _>>()?;
    let mut pref = ReadPreference::new(mode).with_tag_sets(tag_sets);
    if let Some(seconds) = max_staleness {
        pref = pref.with_max_staleness(Duration::from_secs(seconds));
    }

    let client = connect(&source)?;
    let started = Instant::now();
    let result = client.run_read_command("admin", doc! { "ping": 1 }, pref.clone()).await;
    let elapsed = started.elapsed();
    client.shutdown().await;

    match result {
        Ok(_) => {
            println!("✓ ping ({}) answered in {:?}", pref, elapsed);
            Ok(())
        }
        Err(e) => bail!("ping ({}) failed after {:?}: {}", pref, elapsed, e),
    }
}

fn generate_config(mode: &str, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  ruta discover --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            eprintln!("  {}", e);
            return Err(e.into());
        }
    };

    println!("✓ Configuration file is valid");
    match &config.cluster.replica_set {
        Some(name) => println!("  Replica set: {}", name),
        None if config.cluster.direct_connection => println!("  Direct connection"),
        None => println!("  Topology: discovered"),
    }
    println!("  Seeds: {} instances", config.cluster.seeds.len());
    for (i, seed) in config.cluster.seeds.iter().enumerate() {
        println!("    {}: {}", i + 1, seed);
    }
    println!("  Pool: max {} / min {}", config.pool.max_size, config.pool.min_size);
    println!(
        "  Heartbeat: {:?}, selection timeout: {:?}",
        config.monitor.heartbeat_frequency(),
        config.selection.server_selection_timeout()
    );

    Ok(())
}

fn show_version() {
    println!("ruta v{}", env!("CARGO_PKG_VERSION"));
    println!("Topology-aware MongoDB client core");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Replica set, sharded and standalone discovery");
    println!("  • Per-node monitoring with smoothed round-trip times");
    println!("  • Read preferences with tag sets and max staleness");
    println!("  • Bounded connection pools with generation-based clearing");
    println!("  • Retryable reads and writes with command events");
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None if logging.stdout => BoxMakeWriter::new(std::io::stdout),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = if logging.format == "json" {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_writer(writer).boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}
