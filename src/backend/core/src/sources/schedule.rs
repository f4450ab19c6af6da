//! Timer-driven source: emits a payload on a cron expression or a fixed
//! interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

use super::event::Payload;
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{Result, TributaryError};

/// How long to wait before re-evaluating a cron expression with no
/// upcoming fire time.
const EXHAUSTED_RECHECK: Duration = Duration::from_secs(60);

/// Scheduled source configuration. `cron` takes precedence over `interval`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Crontab expression, 5 fields (minute precision) or 6 with seconds
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Static keys merged into every tick
    #[serde(default)]
    pub payload: Payload,

    /// IANA timezone the cron expression is evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: None,
            interval: None,
            payload: Payload::new(),
            timezone: default_timezone(),
        }
    }
}

impl ScheduleConfig {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron: Some(expression.into()),
            ..Default::default()
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Accept plain crontab syntax by prepending a zero seconds field.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Resolved firing rule.
#[derive(Debug, Clone)]
enum Trigger {
    Cron {
        expression: String,
        schedule: cron::Schedule,
        timezone: Tz,
    },
    Every(Duration),
}

impl Trigger {
    fn from_config(config: &ScheduleConfig) -> Result<Self> {
        if let Some(expression) = &config.cron {
            let schedule = cron::Schedule::from_str(&normalize_cron(expression)).map_err(|e| {
                TributaryError::invalid_configuration(format!(
                    "Invalid cron expression '{}': {}",
                    expression, e
                ))
            })?;
            let timezone = Tz::from_str(&config.timezone).map_err(|_| {
                TributaryError::invalid_configuration(format!("Unknown timezone '{}'", config.timezone))
            })?;
            return Ok(Self::Cron {
                expression: expression.trim().to_string(),
                schedule,
                timezone,
            });
        }

        match config.interval {
            Some(interval) if !interval.is_zero() => Ok(Self::Every(interval)),
            _ => Err(TributaryError::missing_configuration("Schedule", "cron or interval")),
        }
    }

    /// Time until the next fire after `now`, or `None` if the schedule is
    /// exhausted.
    fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Every(interval) => Some(*interval),
            Self::Cron { schedule, timezone, .. } => {
                let local = now.with_timezone(timezone);
                let next = schedule.after(&local).next()?;
                Some((next.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Cron { expression, timezone, .. } => format!("cron '{}' ({})", expression, timezone),
            Self::Every(interval) => format!(
                "every {}",
                humantime_serde::re::humantime::format_duration(*interval)
            ),
        }
    }
}

/// Event source firing on a timer.
pub struct ScheduledSource {
    core: SourceCore,
    config: ScheduleConfig,
    poller: parking_lot::Mutex<Option<PollHandle>>,
}

impl ScheduledSource {
    /// Fails when neither a cron expression nor a positive interval is set.
    pub fn new(id: impl Into<String>, config: ScheduleConfig) -> Result<Self> {
        if config.cron.is_none() && !config.interval.is_some_and(|i| !i.is_zero()) {
            return Err(TributaryError::missing_configuration("Schedule", "cron or interval"));
        }
        Ok(Self {
            core: SourceCore::new(id, SourceKind::Schedule),
            config,
            poller: parking_lot::Mutex::new(None),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }
}

/// Build one tick's payload; static keys win over `scheduled_at`.
fn tick_payload(scheduled_at: DateTime<Utc>, extra: &Payload) -> Payload {
    let mut payload = Payload::new();
    payload.insert("scheduled_at".into(), Value::String(scheduled_at.to_rfc3339()));
    for (key, value) in extra {
        payload.insert(key.clone(), value.clone());
    }
    payload
}

struct ScheduleWorker {
    core: SourceCore,
    trigger: Trigger,
    payload: Payload,
}

#[async_trait]
impl PollWorker for ScheduleWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let Some(wait) = self.trigger.until_next(Utc::now()) else {
            tracing::warn!(source_id = %self.core.id(), "Schedule has no upcoming fire time");
            return Ok(PollOutcome::Idle);
        };
        tokio::time::sleep(wait).await;

        let payload = tick_payload(Utc::now(), &self.payload);
        let mut metadata = Payload::new();
        metadata.insert("schedule".into(), json!(self.trigger.describe()));

        // Ticks are not held back by slow subscribers, and stopping the
        // source does not wait for them.
        let core = self.core.clone();
        tokio::spawn(async move {
            if let Err(e) = core.emit(payload, metadata).await {
                tracing::warn!(source_id = %core.id(), error = %e, "Scheduled emission failed");
            }
        });

        Ok(PollOutcome::Continue)
    }
}

#[async_trait]
impl EventSource for ScheduledSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        Trigger::from_config(&self.config).map(|_| ())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let trigger = Trigger::from_config(&self.config)?;
        tracing::info!(source_id = %self.core.id(), schedule = %trigger.describe(), "Scheduler armed");

        let worker = ScheduleWorker {
            core: self.core.clone(),
            trigger,
            payload: self.config.payload.clone(),
        };
        let handle = PollHandle::spawn(self.core.id(), EXHAUSTED_RECHECK, worker);
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        Ok(())
    }
}
