//! # msgq CLI
//!
//! Command-line interface for exercising the msgq runtime against its
//! in-memory broker.
//!
//! Every invocation runs against a fresh broker, so commands that read
//! messages accept `--message` arguments to seed the destination first.
//!
//! Commands:
//! - `send` - publish messages and report their identifiers
//! - `receive` - seed a destination and consume from it, optionally with a selector
//! - `browse` - seed a queue and inspect it without consuming
//! - `match` - evaluate a topic wildcard pattern against topic names
//! - `config` - load, validate and print the connection factory configuration

use clap::{Parser, Subcommand, ValueEnum};
use msgq_runtime::{
    AckMode, ConnectionFactory, DeliveryMode, Destination, FactoryConfig, InMemoryBroker, Message,
    MessagingError, Priority, Queue, SendOptions, Topic,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// msgq - session-based messaging from the command line
#[derive(Parser, Debug)]
#[command(name = "msgq")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Exercise the msgq messaging runtime against an in-memory broker")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MSGQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level, overridden by RUST_LOG
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send messages to a destination
    Send {
        /// Destination, `queue://name` or `topic://name`; bare names are queues
        destination: String,

        /// Message as `body[;key=value...]`, repeatable
        #[arg(short, long = "message", required = true)]
        messages: Vec<String>,

        /// Priority 0-9
        #[arg(short, long)]
        priority: Option<u8>,

        /// Time-to-live in milliseconds; zero or negative means none
        #[arg(long)]
        ttl_ms: Option<i64>,

        /// Send non-persistent
        #[arg(long)]
        non_persistent: bool,
    },

    /// Seed a destination, then receive from it
    Receive {
        destination: String,

        /// Message to seed as `body[;key=value...]`, repeatable
        #[arg(short, long = "message")]
        messages: Vec<String>,

        /// Message selector, e.g. "region = 'emea' AND JMSPriority > 4"
        #[arg(short, long)]
        selector: Option<String>,

        /// Maximum number of messages to receive
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Per-message receive timeout in milliseconds
        #[arg(short, long, default_value = "200")]
        timeout_ms: u64,

        /// Acknowledgment mode of the receiving session
        #[arg(long, value_enum, default_value = "auto")]
        ack_mode: AckModeArg,
    },

    /// Seed a queue, then browse it without consuming
    Browse {
        queue: String,

        /// Message to seed as `body[;key=value...]`, repeatable
        #[arg(short, long = "message")]
        messages: Vec<String>,

        #[arg(short, long)]
        selector: Option<String>,
    },

    /// Check which topic names a wildcard pattern covers
    Match {
        /// Topic pattern using `*` and `**`
        pattern: String,

        /// Topic names to test
        #[arg(required = true)]
        topics: Vec<String>,
    },

    /// Validate and print the resolved configuration
    Config {
        /// Format for the printed configuration
        #[arg(long, value_enum, default_value = "toml")]
        output: ConfigFormat,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Acknowledgment modes selectable for `receive`
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AckModeArg {
    Auto,
    Client,
    DupsOk,
    Transacted,
}

impl From<AckModeArg> for AckMode {
    fn from(mode: AckModeArg) -> Self {
        match mode {
            AckModeArg::Auto => AckMode::Auto,
            AckModeArg::Client => AckMode::Client,
            AckModeArg::DupsOk => AckMode::DupsOk,
            AckModeArg::Transacted => AckMode::Transacted,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output failed: {message}")]
    Output { message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

impl CliError {
    fn invalid(arg: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg: arg.to_string(),
            message: message.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Messaging(MessagingError::ConfigurationError(_)) => 1,
            Self::Messaging(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Output { .. } => 4,
            Self::Logging { .. } => 5,
        }
    }
}

// ============================================================================
// Argument Parsing
// ============================================================================

/// Parse `queue://name`, `topic://name` or a bare queue name
pub fn parse_destination(value: &str) -> Result<Destination, CliError> {
    let invalid = |e: msgq_runtime::ValidationError| CliError::invalid("destination", e.to_string());

    if let Some(name) = value.strip_prefix("topic://") {
        return Ok(Topic::new(name).map_err(invalid)?.into());
    }
    let name = value.strip_prefix("queue://").unwrap_or(value);
    if name.contains("://") {
        return Err(CliError::invalid(
            "destination",
            format!("unknown scheme in '{}'", value),
        ));
    }
    Ok(Queue::new(name).map_err(invalid)?.into())
}

/// Parse `body[;key=value...]` into a message
pub fn parse_message(entry: &str) -> Result<Message, CliError> {
    let mut parts = entry.split(';');
    let body = parts.next().unwrap_or_default();
    let mut message = Message::text(body);

    for part in parts.filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| CliError::invalid("message", format!("expected key=value, got '{}'", part)))?;
        if key.trim().is_empty() {
            return Err(CliError::invalid("message", "property name must not be empty"));
        }
        message = message.with_property(key.trim(), value.trim());
    }
    Ok(message)
}

// ============================================================================
// Reports
// ============================================================================

/// Text rendering for command results
pub trait Render {
    fn text(&self) -> String;
}

/// Render a report in the requested format
pub fn render<T: Serialize + Render>(report: &T, format: OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Text => Ok(report.text()),
        OutputFormat::Json => serde_json::to_string_pretty(report).map_err(|e| CliError::Output {
            message: e.to_string(),
        }),
    }
}

#[derive(Debug, Serialize)]
pub struct SendReport {
    pub destination: String,
    pub message_ids: Vec<String>,
    /// Messages waiting on the queue afterwards; zero for topics
    pub depth: usize,
}

impl Render for SendReport {
    fn text(&self) -> String {
        let mut lines: Vec<String> = self.message_ids.iter().map(|id| format!("sent {}", id)).collect();
        lines.push(format!("{} now holds {} message(s)", self.destination, self.depth));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub body: String,
    pub priority: u8,
    pub redelivered: bool,
    pub properties: std::collections::BTreeMap<String, String>,
}

impl From<&Message> for ReceivedMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.message_id.as_ref().map(|id| id.to_string()),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            priority: message.priority.value(),
            redelivered: message.redelivered,
            properties: message
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessagesReport {
    pub destination: String,
    pub messages: Vec<ReceivedMessage>,
}

impl Render for MessagesReport {
    fn text(&self) -> String {
        if self.messages.is_empty() {
            return format!("no messages on {}", self.destination);
        }
        self.messages
            .iter()
            .map(|m| {
                let properties: Vec<String> =
                    m.properties.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!(
                    "[{}] priority={} {}{}",
                    m.message_id.as_deref().unwrap_or("-"),
                    m.priority,
                    m.body,
                    if properties.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", properties.join(", "))
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct MatchResult {
    pub topic: String,
    pub matches: bool,
}

#[derive(Debug, Serialize)]
pub struct MatchReport {
    pub pattern: String,
    pub wildcard: bool,
    pub results: Vec<MatchResult>,
}

impl Render for MatchReport {
    fn text(&self) -> String {
        self.results
            .iter()
            .map(|r| format!("{} {}", if r.matches { "match   " } else { "no match" }, r.topic))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ConfigReport {
    pub config: FactoryConfig,
    #[serde(skip)]
    pub format: ConfigFormat,
}

impl Render for ConfigReport {
    fn text(&self) -> String {
        match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(&self.config).unwrap_or_else(|e| e.to_string()),
            ConfigFormat::Json => {
                serde_json::to_string_pretty(&self.config).unwrap_or_else(|e| e.to_string())
            }
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Runs commands against one in-memory broker
pub struct Runner {
    factory: ConnectionFactory,
    broker: InMemoryBroker,
}

impl Runner {
    pub fn new(config: FactoryConfig) -> Result<Self, CliError> {
        let broker = InMemoryBroker::new(config.in_memory.clone());
        let factory = ConnectionFactory::with_broker(config, broker.clone())?;
        Ok(Self { factory, broker })
    }

    pub fn config(&self) -> &FactoryConfig {
        self.factory.config()
    }

    async fn seed(&self, destination: &Destination, entries: &[String]) -> Result<Vec<String>, CliError> {
        let connection = self.factory.create_connection().await?;
        let session = connection.create_session(false, AckMode::Auto).await?;
        let producer = session.create_producer(Some(destination))?;

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = producer.send(parse_message(entry)?).await?;
            ids.push(id.to_string());
        }
        connection.close().await?;
        debug!(destination = %destination, count = ids.len(), "Seeded destination");
        Ok(ids)
    }

    pub async fn send(
        &self,
        destination: &str,
        messages: &[String],
        priority: Option<u8>,
        ttl_ms: Option<i64>,
        non_persistent: bool,
    ) -> Result<SendReport, CliError> {
        let destination = parse_destination(destination)?;
        let mut options = SendOptions::new();
        if let Some(priority) = priority {
            let priority =
                Priority::new(priority).map_err(|e| CliError::invalid("priority", e.to_string()))?;
            options = options.with_priority(priority);
        }
        if let Some(ttl) = ttl_ms {
            options = options.with_time_to_live(chrono::Duration::milliseconds(ttl));
        }
        if non_persistent {
            options = options.with_delivery_mode(DeliveryMode::NonPersistent);
        }

        let connection = self.factory.create_connection().await?;
        let session = connection.create_session(false, AckMode::Auto).await?;
        let producer = session.create_producer(None)?;

        let mut message_ids = Vec::with_capacity(messages.len());
        for entry in messages {
            let id = producer
                .send_with(Some(&destination), parse_message(entry)?, options)
                .await?;
            message_ids.push(id.to_string());
        }
        connection.close().await?;

        info!(destination = %destination, count = message_ids.len(), "Messages sent");
        Ok(SendReport {
            depth: self.broker.queue_depth(&destination),
            destination: destination.to_string(),
            message_ids,
        })
    }

    pub async fn receive(
        &self,
        destination: &str,
        seed: &[String],
        selector: Option<&str>,
        count: usize,
        timeout: Duration,
        ack_mode: AckMode,
    ) -> Result<MessagesReport, CliError> {
        let destination = parse_destination(destination)?;
        let connection = self.factory.create_connection().await?;
        let transacted = ack_mode == AckMode::Transacted;
        let session = connection.create_session(transacted, ack_mode).await?;
        let consumer = session.create_consumer(&destination, selector, false).await?;

        // Subscribe before seeding so topic subscribers see the messages
        self.seed(&destination, seed).await?;
        connection.start().await?;

        let mut received = Vec::new();
        let mut last = None;
        while received.len() < count {
            let Some(message) = consumer.receive(timeout).await? else {
                break;
            };
            received.push(ReceivedMessage::from(&message));
            last = Some(message);
        }

        match (ack_mode, &last) {
            (AckMode::Client, Some(message)) => session.acknowledge(message).await?,
            (AckMode::Transacted, _) => session.commit().await?,
            _ => {}
        }
        connection.close().await?;

        Ok(MessagesReport {
            destination: destination.to_string(),
            messages: received,
        })
    }

    pub async fn browse(
        &self,
        queue: &str,
        seed: &[String],
        selector: Option<&str>,
    ) -> Result<MessagesReport, CliError> {
        let destination = parse_destination(queue)?;
        self.seed(&destination, seed).await?;

        let connection = self.factory.create_connection().await?;
        let session = connection.create_session(false, AckMode::Auto).await?;
        let browser = session.create_browser(&destination, selector).await?;
        let messages = browser.remaining().await?;
        connection.close().await?;

        Ok(MessagesReport {
            destination: destination.to_string(),
            messages: messages.iter().map(ReceivedMessage::from).collect(),
        })
    }
}

/// Evaluate `pattern` against each topic name
pub fn match_topics(pattern: &str, topics: &[String]) -> Result<MatchReport, CliError> {
    let pattern_topic =
        Topic::new(pattern).map_err(|e| CliError::invalid("pattern", e.to_string()))?;
    let results = topics
        .iter()
        .map(|topic| MatchResult {
            topic: topic.clone(),
            matches: pattern_topic.matches(topic),
        })
        .collect();

    Ok(MatchReport {
        pattern: pattern.to_string(),
        wildcard: pattern_topic.is_wildcard(),
        results,
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Initialize logging based on CLI arguments
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Execute a parsed command line and return the rendered output
pub async fn execute(cli: Cli) -> Result<String, CliError> {
    let config = FactoryConfig::load(cli.config.as_deref()).map_err(MessagingError::from)?;
    let runner = Runner::new(config)?;
    debug!(scheme = %runner.config().scheme, "Configuration loaded");
    let format = cli.format;

    match cli.command {
        Commands::Send {
            destination,
            messages,
            priority,
            ttl_ms,
            non_persistent,
        } => render(
            &runner
                .send(&destination, &messages, priority, ttl_ms, non_persistent)
                .await?,
            format,
        ),
        Commands::Receive {
            destination,
            messages,
            selector,
            count,
            timeout_ms,
            ack_mode,
        } => render(
            &runner
                .receive(
                    &destination,
                    &messages,
                    selector.as_deref(),
                    count,
                    Duration::from_millis(timeout_ms),
                    ack_mode.into(),
                )
                .await?,
            format,
        ),
        Commands::Browse {
            queue,
            messages,
            selector,
        } => render(&runner.browse(&queue, &messages, selector.as_deref()).await?, format),
        Commands::Match { pattern, topics } => render(&match_topics(&pattern, &topics)?, format),
        Commands::Config { output } => {
            let mut config = runner.config().clone();
            if config.password.is_some() {
                config.password = Some("********".to_string());
            }
            render(&ConfigReport { config, format: output }, format)
        }
    }
}

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;
    let output = execute(cli).await?;
    println!("{}", output);
    Ok(())
}
