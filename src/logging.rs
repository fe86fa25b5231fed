//! Structured Logging for paywatch
//!
//! Library code logs through `tracing` with `paywatch::*` targets. Lifecycle
//! milestones (confirmation, forwarding) are additionally written as
//! [`LogEvent`] JSON records so they can be picked out of aggregated logs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use paywatch::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, false)?;
//! tracing::info!(target: "paywatch::payment", payment_id = %id, "payment started");
//! ```

use rand::Rng;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServiceConfig;

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Payment state changes
    Payment,
    /// Forwarding to the main wallet
    Forwarding,
    /// Live feed connectivity
    Feed,
    /// Startup, shutdown
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Usually the payment id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_str().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": {:?}}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Lifecycle Event Logging
// ============================================================================

/// Log a payment lifecycle event
pub fn log_payment_event(
    event_type: &str,
    payment_id: &str,
    amount_sats: u64,
    success: bool,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Payment, event_type)
        .with_correlation_id(payment_id)
        .with_data(serde_json::json!({
            "payment_id": payment_id,
            "amount_sats": amount_sats,
            "success": success
        }));

    if let Some(err) = error {
        event = event.with_error("PAYMENT_ERROR", err);
    }

    if success {
        tracing::info!(target: "paywatch::payment", "{}", event.to_json());
    } else {
        tracing::error!(target: "paywatch::payment", "{}", event.to_json());
    }
}

/// Log a forwarding attempt
pub fn log_forward_event(
    event_type: &str,
    payment_id: &str,
    amount_sats: u64,
    destination: &str,
    success: bool,
    txid: Option<&str>,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Forwarding, event_type)
        .with_correlation_id(payment_id)
        .with_data(serde_json::json!({
            "payment_id": payment_id,
            "amount_sats": amount_sats,
            "destination": destination,
            "txid": txid,
            "success": success
        }));

    if let Some(err) = error {
        event = event.with_error("FORWARD_ERROR", err);
    }

    if success {
        tracing::info!(target: "paywatch::forward", "{}", event.to_json());
    } else {
        tracing::warn!(target: "paywatch::forward", "{}", event.to_json());
    }
}

fn feed_event(event_type: &str, payment_id: &str, address: &str, error: Option<&str>) -> LogEvent {
    let level = if error.is_some() { LogLevel::Warn } else { LogLevel::Info };
    let mut event = LogEvent::new(level, EventCategory::Feed, event_type)
        .with_correlation_id(payment_id)
        .with_data(serde_json::json!({
            "payment_id": payment_id,
            "address": address
        }));

    if let Some(err) = error {
        event = event.with_error("FEED_ERROR", err);
    }
    event
}

/// Log a live feed event; failures are logged at warn
pub fn log_feed_event(event_type: &str, payment_id: &str, address: &str, error: Option<&str>) {
    let event = feed_event(event_type, payment_id, address, error);
    if error.is_some() {
        tracing::warn!(target: "paywatch::feed", "{}", event.to_json());
    } else {
        tracing::info!(target: "paywatch::feed", "{}", event.to_json());
    }
}

/// Log a process-level event (startup, shutdown)
pub fn log_system_event(message: &str, data: serde_json::Value) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::System, message).with_data(data);
    tracing::info!(target: "paywatch::system", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("paywatch={}", level.as_str())));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from the binary's configuration
pub fn init_from_config(config: &ServiceConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Short random id for correlating one CLI session's log lines
pub fn generate_correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis() as u64;
    format!("{:x}-{:04x}", millis & 0xFFFF_FFFF, rand::thread_rng().gen::<u16>())
}

// ============================================================================
// Tests
// ============================================================================
