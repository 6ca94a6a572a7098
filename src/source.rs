//! Event sources for the collection engine.
//!
//! A source knows which log channels it can read and produces the events of
//! one channel inside a time window. [`SyntheticSource`] generates realistic
//! Windows event log records and is used when no native reader is available.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use thiserror::Error;

use crate::event::{Event, Severity};

/// Default number of events generated per channel and window.
const DEFAULT_EVENTS_PER_CHANNEL: usize = 15;

/// Default delay between two delivered events.
const DEFAULT_PACING_MS: u64 = 100;

/// Severity weights in percent, in [`Severity::all`] order.
/// Info: 60%, Warning: 20%, Error: 15%, AuditSuccess: 3%, AuditFailure: 2%
const SEVERITY_WEIGHTS: [u32; 5] = [60, 20, 15, 3, 2];

/// Errors raised while collecting events.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The requested channel is not known to the source
    #[error("unknown log channel '{0}'")]
    UnknownChannel(String),

    /// Reading a channel failed
    #[error("failed to read channel '{channel}': {reason}")]
    Read { channel: String, reason: String },

    /// The collection request cannot be run
    #[error("invalid collection request: {0}")]
    InvalidRequest(String),
}

/// Closed time interval `[start, end]` at second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, truncating both bounds to whole seconds.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.trunc_subsecs(0),
            end: end.trunc_subsecs(0),
        }
    }

    /// Window covering `lookback` before `end`.
    pub fn lookback(end: DateTime<Utc>, lookback: Duration) -> Self {
        let span = chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(end - span, end)
    }

    /// Window length in whole seconds (zero for empty or inverted windows).
    pub fn span_secs(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// A readable collection of log channels.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Map a requested identifier (canonical name or alias) to a channel name.
    ///
    /// Returns `None` for channels the source does not know.
    fn resolve(&self, identifier: &str) -> Option<String>;

    /// Read the events of `channel` inside `window`, oldest first.
    async fn read(&self, channel: &str, window: &TimeWindow) -> Result<Vec<Event>, CollectError>;

    /// Delay the engine waits between two delivered events.
    fn pacing(&self) -> Duration {
        Duration::ZERO
    }
}

/// Static description of a Windows event log.
#[derive(Debug)]
pub struct LogChannel {
    /// Canonical log name, also used as the event category
    pub name: &'static str,

    /// Alternative names accepted when resolving a request (localized UI names)
    pub aliases: &'static [&'static str],

    /// Providers that write to this log
    pub providers: &'static [&'static str],

    /// Typical messages found in this log
    pub messages: &'static [&'static str],
}

/// The logs known to the synthetic source.
pub static CHANNELS: &[LogChannel] = &[
    LogChannel {
        name: "System",
        aliases: &["Система"],
        providers: &[
            "Microsoft-Windows-Kernel-General",
            "Service Control Manager",
            "Microsoft-Windows-Power-Troubleshooter",
            "DCOM",
            "Microsoft-Windows-Kernel-Power",
        ],
        messages: &[
            "The system has been started after a reboot",
            "The service was started successfully",
            "An error occurred while initializing a device driver",
            "The computer has entered sleep mode",
            "DHCP connection timed out for network adapter",
        ],
    },
    LogChannel {
        name: "Application",
        aliases: &["Приложение"],
        providers: &[
            "Application Hang",
            "Application Error",
            "Windows Error Reporting",
            "ESENT",
            "Microsoft-Windows-RestartManager",
        ],
        messages: &[
            "The application terminated with an error",
            "The application is not responding",
            "Product installation completed successfully",
            "An application update is available",
            "Component initialization failed",
        ],
    },
    LogChannel {
        name: "Security",
        aliases: &["Безопасность"],
        providers: &[
            "Microsoft-Windows-Security-Auditing",
            "Microsoft-Windows-Eventlog",
            "Microsoft-Windows-Audit",
        ],
        messages: &[
            "An account was successfully logged on",
            "An account failed to log on",
            "A user account was created",
            "A user account password was changed",
            "A member was added to the Administrators group",
        ],
    },
    LogChannel {
        name: "Setup",
        aliases: &["Настройка"],
        providers: &[
            "Microsoft-Windows-Setup",
            "Microsoft-Windows-Servicing",
            "Microsoft-Windows-WindowsUpdateClient",
        ],
        messages: &[
            "Update installation completed successfully",
            "Update installation failed",
            "Update installation started",
            "Update download completed",
            "A restart is required to finish installing updates",
        ],
    },
    LogChannel {
        name: "DNS Server",
        aliases: &["Перенаправление DNS-сервера"],
        providers: &[
            "Microsoft-Windows-DNS-Client",
            "Microsoft-Windows-DNS-Server",
            "DNSAPI",
        ],
        messages: &[
            "Failed to resolve host name",
            "The DNS server has started",
            "The DNS zone was updated",
            "Failed to load the DNS zone",
            "DNS query forwarded to an external server",
        ],
    },
    LogChannel {
        name: "Directory Service",
        aliases: &["Active Directory"],
        providers: &[
            "Microsoft-Windows-ActiveDirectory_DomainService",
            "NTDS ISAM",
            "Microsoft-Windows-GroupPolicy",
        ],
        messages: &[
            "Domain replication succeeded",
            "Domain replication failed",
            "Group policy was changed",
            "The domain schema was updated",
            "Active Directory database defragmentation completed",
        ],
    },
];

/// Find a known log by canonical name or alias, ignoring case.
pub fn find_channel(identifier: &str) -> Option<&'static LogChannel> {
    let wanted = identifier.trim().to_lowercase();
    CHANNELS.iter().find(|channel| {
        channel.name.to_lowercase() == wanted
            || channel.aliases.iter().any(|alias| alias.to_lowercase() == wanted)
    })
}

/// Configuration for the synthetic source.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Number of events produced for each channel read
    pub events_per_channel: usize,

    /// Delay between two delivered events
    pub pacing: Duration,

    /// Host name stamped on every event
    pub origin_host: String,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            events_per_channel: DEFAULT_EVENTS_PER_CHANNEL,
            pacing: Duration::from_millis(DEFAULT_PACING_MS),
            origin_host: "localhost".to_string(),
        }
    }
}

/// Source generating plausible Windows event log records.
///
/// Severities follow a weighted distribution (mostly informational, some
/// warnings and errors, rare audit records) and timestamps are spread
/// uniformly over the requested window.
pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SyntheticConfig::default())
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Generate the events of one channel, sorted by timestamp.
    fn generate(&self, channel: &LogChannel, window: &TimeWindow) -> Result<Vec<Event>, CollectError> {
        let weights = WeightedIndex::new(SEVERITY_WEIGHTS).map_err(|e| CollectError::Read {
            channel: channel.name.to_string(),
            reason: e.to_string(),
        })?;

        let mut rng = rand::thread_rng();
        let span = window.span_secs();
        let start = window.start.timestamp();

        let mut events: Vec<Event> = (0..self.config.events_per_channel)
            .map(|_| {
                let offset = rng.gen_range(0..=span);
                let timestamp = Utc
                    .timestamp_opt(start + offset, 0)
                    .single()
                    .unwrap_or(window.end);
                let severity = Severity::all()[weights.sample(&mut rng)];

                Event {
                    id: rng.gen_range(1000..=9999),
                    timestamp,
                    source: pick(&mut rng, channel.providers)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Unknown-{}", channel.name)),
                    severity,
                    category: channel.name.to_string(),
                    message: pick(&mut rng, channel.messages)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Event in log {}", channel.name)),
                    origin_host: self.config.origin_host.clone(),
                    log_channel: channel.name.to_string(),
                }
            })
            .collect();

        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn pick<'a>(rng: &mut impl Rng, items: &[&'a str]) -> Option<&'a str> {
    if items.is_empty() {
        None
    } else {
        Some(items[rng.gen_range(0..items.len())])
    }
}

#[async_trait]
impl EventSource for SyntheticSource {
    fn resolve(&self, identifier: &str) -> Option<String> {
        find_channel(identifier).map(|channel| channel.name.to_string())
    }

    async fn read(&self, channel: &str, window: &TimeWindow) -> Result<Vec<Event>, CollectError> {
        let log = find_channel(channel).ok_or_else(|| CollectError::UnknownChannel(channel.to_string()))?;
        self.generate(log, window)
    }

    fn pacing(&self) -> Duration {
        self.config.pacing
    }
}
