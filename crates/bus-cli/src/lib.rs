//! # Bus CLI
//!
//! Command-line interface for the bus runtime.
//!
//! This module provides CLI commands for:
//! - Sending batches of messages to a queue or topic
//! - Running a processor against a queue or topic subscription
//! - Validating and displaying the resolved configuration
//! - Generating shell completions
//!
//! Commands run against the in-memory broker, so `process --seed` is the way
//! to give a processor something to work on within one invocation.

use bus_runtime::{
    BusClient, BusConfig, BusError, ConfigurationError, EntityName, EntityPath, ErrorEvent,
    ErrorRouter, HandlerError, Message, MessageBatch, ReceivedMessage,
};
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix used for generated message bodies
pub const DEFAULT_BODY_PREFIX: &str = "This a message - ";

// ============================================================================
// CLI Structure
// ============================================================================

/// Bus CLI - send and process messages through the bus runtime
#[derive(Parser)]
#[command(name = "bus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and process messages through the bus runtime")]
#[command(
    long_about = "Sends message batches and runs concurrent processors with graceful drain against the in-memory broker"
)]
pub struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, env = "BUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send generated messages in one batch
    Send(SendArgs),

    /// Run a processor until stopped
    Process(ProcessArgs),

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Queue or topic to send to
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SendTarget {
    /// Queue name
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Topic name
    #[arg(short, long)]
    pub topic: Option<String>,
}

/// Arguments of the `send` command
#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[command(flatten)]
    pub target: SendTarget,

    /// Number of messages to generate
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Body prefix; the message index is appended
    #[arg(long, default_value = DEFAULT_BODY_PREFIX)]
    pub body_prefix: String,

    /// Override the configured batch count limit
    #[arg(long)]
    pub max_batch_count: Option<usize>,

    /// Send refused messages in follow-up batches instead of dropping them
    #[arg(long)]
    pub split: bool,
}

/// Arguments of the `process` command
#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Queue name
    #[arg(short, long, conflicts_with_all = ["topic", "subscription"])]
    pub queue: Option<String>,

    /// Topic name (requires --subscription)
    #[arg(short, long, requires = "subscription")]
    pub topic: Option<String>,

    /// Subscription name (requires --topic)
    #[arg(short, long, requires = "topic")]
    pub subscription: Option<String>,

    /// Messages to enqueue before the processor starts
    #[arg(long, default_value = "0")]
    pub seed: usize,

    /// Override the configured concurrency limit
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Override the configured drain timeout (milliseconds, 0 = wait forever)
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Stop after this many messages were handled
    #[arg(long)]
    pub stop_after: Option<usize>,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Bus(BusError::Authentication { .. }) => 2,
            Self::Bus(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),

    #[error("Could not render configuration: {message}")]
    Render { message: String },
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli);

    run(cli).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_configuration(cli.config.as_deref())?;

    match cli.command {
        Commands::Send(args) => {
            let report = execute_send_command(&args, &config).await?;
            println!(
                "Sent {} message(s) in {} batch(es) to {}",
                report.sent, report.batches, report.entity
            );
            for index in &report.refused {
                println!("Message {} did not fit in the batch", index);
            }
            Ok(())
        }
        Commands::Process(args) => {
            let report = execute_process_command(&args, &config).await?;
            println!(
                "Processed {} message(s), {} failed",
                report.handled, report.failed
            );
            Ok(())
        }
        Commands::Config { show, format } => execute_config_command(&config, show, format),
        Commands::Completions { shell } => {
            execute_completions_command(shell);
            Ok(())
        }
    }
}

// ============================================================================
// Logging and Configuration
// ============================================================================

/// Initialize logging based on CLI arguments; logs go to stderr so command
/// output stays parseable
fn initialize_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bus_runtime={0},bus_cli={0}", cli.log_level)));

    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let result = if cli.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load configuration from an optional file plus `BUS__` environment
/// variables, e.g. `BUS__PROCESSOR__CONCURRENCY_LIMIT=4`
pub fn load_configuration(path: Option<&Path>) -> Result<BusConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path).required(true));
        info!(path = %path.display(), "Loading configuration file");
    }

    let config: BusConfig = builder
        .add_source(
            config::Environment::with_prefix("BUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Outcome of `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub entity: String,
    pub sent: usize,
    pub batches: usize,
    /// Indices of messages that were not sent
    pub refused: Vec<usize>,
}

/// Outcome of `process`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub handled: usize,
    pub failed: usize,
}

fn entity_name(arg: &str, value: &str) -> Result<EntityName, CliError> {
    EntityName::new(value.to_string()).map_err(|e| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: e.to_string(),
    })
}

/// Generate `count` messages numbered from zero
pub fn build_messages(count: usize, prefix: &str) -> Vec<Message> {
    (0..count)
        .map(|i| Message::from(format!("{}{}", prefix, i)))
        .collect()
}

impl SendTarget {
    pub fn entity(&self) -> Result<EntityPath, CliError> {
        match (&self.queue, &self.topic) {
            (Some(queue), None) => Ok(EntityPath::queue(entity_name("queue", queue)?)),
            (None, Some(topic)) => Ok(EntityPath::topic(entity_name("topic", topic)?)),
            _ => Err(CliError::InvalidArgument {
                arg: "target".to_string(),
                message: "exactly one of --queue or --topic is required".to_string(),
            }),
        }
    }
}

impl ProcessArgs {
    pub fn entity(&self) -> Result<EntityPath, CliError> {
        match (&self.queue, &self.topic, &self.subscription) {
            (Some(queue), None, None) => Ok(EntityPath::queue(entity_name("queue", queue)?)),
            (None, Some(topic), Some(subscription)) => Ok(EntityPath::subscription(
                entity_name("topic", topic)?,
                entity_name("subscription", subscription)?,
            )),
            _ => Err(CliError::InvalidArgument {
                arg: "source".to_string(),
                message: "use --queue, or --topic together with --subscription".to_string(),
            }),
        }
    }
}

/// Execute send command
pub async fn execute_send_command(
    args: &SendArgs,
    config: &BusConfig,
) -> Result<SendReport, CliError> {
    let entity = args.target.entity()?;

    let mut config = config.clone();
    if let Some(max_batch_count) = args.max_batch_count {
        config.client.batch.max_batch_count = max_batch_count;
    }

    let (client, _broker) = BusClient::in_memory(&config).await?;
    let sender = client.create_sender(entity.clone()).await?;
    let messages = build_messages(args.count, &args.body_prefix);

    let report = if args.split {
        let batches = sender.send_messages(messages).await?;
        SendReport {
            entity: entity.to_string(),
            sent: args.count,
            batches,
            refused: Vec::new(),
        }
    } else {
        let mut batch: MessageBatch = sender.create_batch();
        let refused = batch.add_all(&messages);
        for index in &refused {
            warn!(index = index, "Message did not fit in the batch");
        }
        sender.send(&batch).await?;
        SendReport {
            entity: entity.to_string(),
            sent: batch.len(),
            batches: usize::from(!batch.is_empty()),
            refused,
        }
    };

    client.close().await?;
    info!(entity = %entity, sent = report.sent, "Send finished");
    Ok(report)
}

/// Execute process command
pub async fn execute_process_command(
    args: &ProcessArgs,
    config: &BusConfig,
) -> Result<ProcessReport, CliError> {
    let entity = args.entity()?;

    let mut options = config.processor.clone();
    if let Some(concurrency) = args.concurrency {
        options.concurrency_limit = concurrency;
    }
    if let Some(drain_timeout_ms) = args.drain_timeout_ms {
        options.drain_timeout = Duration::from_millis(drain_timeout_ms);
    }

    let (client, broker) = BusClient::in_memory(config).await?;
    let send_entity = match &entity {
        EntityPath::Subscription {
            topic,
            subscription,
        } => {
            broker.create_subscription(topic.clone(), subscription.clone());
            EntityPath::topic(topic.clone())
        }
        other => other.clone(),
    };

    if args.seed > 0 {
        let sender = client.create_sender(send_entity).await?;
        sender
            .send_messages(build_messages(args.seed, DEFAULT_BODY_PREFIX))
            .await?;
        info!(count = args.seed, "Seeded messages");
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let limit_reached = Arc::new(Notify::new());

    let handler = {
        let handled = handled.clone();
        let limit_reached = limit_reached.clone();
        let stop_after = args.stop_after;
        move |message: ReceivedMessage| {
            let handled = handled.clone();
            let limit_reached = limit_reached.clone();
            async move {
                println!(
                    "Received: {} (delivery {}, attempt {})",
                    message.body_text(),
                    message.delivery_id,
                    message.delivery_count
                );
                let total = handled.fetch_add(1, Ordering::SeqCst) + 1;
                if stop_after.is_some_and(|limit| total >= limit) {
                    limit_reached.notify_one();
                }
                Ok::<(), HandlerError>(())
            }
        }
    };

    let errors = {
        let failed = failed.clone();
        ErrorRouter::new(Arc::new(move |event: ErrorEvent| {
            let failed = failed.clone();
            async move {
                failed.fetch_add(1, Ordering::SeqCst);
                eprintln!("Error ({}): {}", event.context.source, event.error);
            }
        }))
    };

    let processor = client.create_processor(entity.clone(), options).await?;
    processor.start(Arc::new(handler), errors).await?;
    info!(entity = %entity, "Processing; press Ctrl-C to stop");

    let duration = args.duration.map(Duration::from_secs);
    tokio::select! {
        _ = limit_reached.notified(), if args.stop_after.is_some() => {
            info!("Message limit reached");
        }
        _ = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        } => {
            info!("Duration elapsed");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
    }

    client.close().await?;

    Ok(ProcessReport {
        handled: handled.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    })
}

/// Render configuration in the requested format, hiding secrets
pub fn render_configuration(config: &BusConfig, format: ConfigFormat) -> Result<String, ConfigError> {
    let mut shown = config.clone();
    if shown.in_memory.required_secret.is_some() {
        shown.in_memory.required_secret = Some("<redacted>".to_string());
    }

    match format {
        ConfigFormat::Toml => toml::to_string_pretty(&shown).map_err(|e| ConfigError::Render {
            message: e.to_string(),
        }),
        ConfigFormat::Json => {
            serde_json::to_string_pretty(&shown).map_err(|e| ConfigError::Render {
                message: e.to_string(),
            })
        }
    }
}

/// Execute config command; loading already validated the configuration
fn execute_config_command(
    config: &BusConfig,
    show: bool,
    format: ConfigFormat,
) -> Result<(), CliError> {
    if show {
        println!("{}", render_configuration(config, format)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

/// Execute completions command
fn execute_completions_command(shell: clap_complete::Shell) {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
}
