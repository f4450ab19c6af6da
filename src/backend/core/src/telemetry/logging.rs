//! Structured logging with JSON/pretty formats and secret redaction.
//!
//! - JSON format for production environments
//! - Pretty format for development
//! - Per-module log level configuration
//! - Redaction of secrets before header maps and payload fields are logged

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Global redactor instance for sensitive data.
static REDACTOR: OnceLock<SensitiveFieldRedactor> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels, e.g. `tributary_core::sources::kafka = "debug"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default = "default_include_location")]
    pub include_location: bool,

    /// Whether to include thread information
    #[serde(default)]
    pub include_thread: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: default_include_location(),
            include_thread: false,
            include_target: default_include_target(),
            span_events: SpanEventConfig::default(),
            redaction: RedactionConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub on_new: bool,

    #[serde(default = "default_on_close")]
    pub on_close: bool,
}

impl Default for SpanEventConfig {
    fn default() -> Self {
        Self {
            on_new: false,
            on_close: default_on_close(),
        }
    }
}

impl SpanEventConfig {
    fn to_fmt_span(&self) -> FmtSpan {
        let mut span = FmtSpan::NONE;
        if self.on_new {
            span |= FmtSpan::NEW;
        }
        if self.on_close {
            span |= FmtSpan::CLOSE;
        }
        span
    }
}

/// Configuration for sensitive data redaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_redaction_enabled")]
    pub enabled: bool,

    #[serde(default = "default_redaction_patterns")]
    pub patterns: Vec<RedactionPattern>,

    /// Replacement text for redacted values
    #[serde(default = "default_redaction_replacement")]
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_redaction_enabled(),
            patterns: default_redaction_patterns(),
            replacement: default_redaction_replacement(),
        }
    }
}

/// A pattern for identifying sensitive data to redact.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionPattern {
    pub name: String,

    /// Field or header names to match (case-insensitive substring)
    #[serde(default)]
    pub field_names: Vec<String>,

    /// Regex matched against values
    #[serde(default)]
    pub value_pattern: Option<String>,
}

/// Redacts secrets from field values before they reach a log line.
#[derive(Debug, Clone)]
pub struct SensitiveFieldRedactor {
    field_names: Vec<String>,
    value_regexes: Vec<regex::Regex>,
    replacement: String,
    enabled: bool,
}

impl SensitiveFieldRedactor {
    /// Create a new redactor from configuration.
    ///
    /// Patterns whose regex does not compile are skipped with a warning.
    pub fn new(config: &RedactionConfig) -> Self {
        let mut field_names = Vec::new();
        let mut value_regexes = Vec::new();

        for pattern in &config.patterns {
            field_names.extend(pattern.field_names.iter().map(|s| s.to_lowercase()));
            if let Some(raw) = &pattern.value_pattern {
                match regex::Regex::new(raw) {
                    Ok(re) => value_regexes.push(re),
                    Err(e) => tracing::warn!(
                        pattern = %pattern.name,
                        error = %e,
                        "Ignoring invalid redaction pattern"
                    ),
                }
            }
        }

        Self {
            field_names,
            value_regexes,
            replacement: config.replacement.clone(),
            enabled: config.enabled,
        }
    }

    /// Check if a field name should be redacted.
    pub fn should_redact_field(&self, field_name: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let lower = field_name.to_lowercase();
        self.field_names.iter().any(|f| lower.contains(f.as_str()))
    }

    /// Redact any secret-looking substrings of a value.
    pub fn redact_value(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }

        let mut result = value.to_string();
        for regex in &self.value_regexes {
            result = regex.replace_all(&result, self.replacement.as_str()).into_owned();
        }
        result
    }

    /// Redact a field value, checking both field name and value patterns.
    pub fn redact(&self, field_name: &str, value: &str) -> String {
        if self.should_redact_field(field_name) {
            return self.replacement.clone();
        }

        self.redact_value(value)
    }

    /// Produce a copy of a header map that is safe to log.
    pub fn redact_headers(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| (name.clone(), self.redact(name, value)))
            .collect()
    }

    /// Get the global redactor instance.
    pub fn global() -> &'static SensitiveFieldRedactor {
        REDACTOR.get_or_init(|| SensitiveFieldRedactor::new(&RedactionConfig::default()))
    }
}

fn default_log_level() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

fn default_include_location() -> bool {
    true
}

fn default_include_target() -> bool {
    true
}

fn default_on_close() -> bool {
    true
}

fn default_redaction_enabled() -> bool {
    true
}

fn default_redaction_replacement() -> String {
    "[REDACTED]".to_string()
}

fn default_redaction_patterns() -> Vec<RedactionPattern> {
    vec![
        RedactionPattern {
            name: "signatures".to_string(),
            field_names: vec!["signature".to_string(), "x-hub-signature".to_string()],
            value_pattern: Some(r"sha(?:224|256|384|512)=[0-9a-fA-F]{16,}".to_string()),
        },
        RedactionPattern {
            name: "credentials".to_string(),
            field_names: vec![
                "authorization".to_string(),
                "password".to_string(),
                "secret".to_string(),
                "api_key".to_string(),
                "api-key".to_string(),
                "cookie".to_string(),
            ],
            value_pattern: None,
        },
        RedactionPattern {
            name: "tokens".to_string(),
            field_names: vec!["token".to_string(), "bearer".to_string()],
            value_pattern: Some(r"eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+".to_string()),
        },
        RedactionPattern {
            name: "dsn_passwords".to_string(),
            field_names: vec!["dsn".to_string()],
            value_pattern: Some(r"://[^:/@\s]+:[^@\s]+@".to_string()),
        },
    ]
}

/// Initialize the logging subsystem.
///
/// In `development`, a JSON format that was never changed from the default
/// is swapped for the pretty printer.
///
/// # Errors
///
/// Returns an error if a level directive is invalid or a global subscriber
/// is already set.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let _ = REDACTOR.set(SensitiveFieldRedactor::new(&config.redaction));

    let mut filter = EnvFilter::try_new(&config.level)?;
    for (module, level) in &config.module_levels {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }

    let format = if environment == "development" && config.format == LogFormat::Json {
        &LogFormat::Pretty
    } else {
        &config.format
    };

    let base = fmt::layer()
        .with_span_events(config.span_events.to_fmt_span())
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread)
        .with_thread_names(config.include_thread)
        .with_target(config.include_target);

    let fmt_layer = match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_field_names() {
        let redactor = SensitiveFieldRedactor::new(&RedactionConfig::default());

        assert!(redactor.should_redact_field("Authorization"));
        assert!(redactor.should_redact_field("X-GenXAI-Signature"));
        assert!(redactor.should_redact_field("x-api-key"));
        assert!(!redactor.should_redact_field("content-type"));
    }

    #[test]
    fn test_redaction_values() {
        let redactor = SensitiveFieldRedactor::new(&RedactionConfig::default());

        let dsn = "postgres://app:hunter2@db:5432/app";
        assert_eq!(redactor.redact_value(dsn), "postgres[REDACTED]db:5432/app");

        let sig = "forwarded sha256=0123456789abcdef0123456789abcdef";
        assert_eq!(redactor.redact_value(sig), "forwarded [REDACTED]");

        assert_eq!(redactor.redact_value("hello world"), "hello world");
    }

    #[test]
    fn test_redact_headers() {
        let redactor = SensitiveFieldRedactor::new(&RedactionConfig::default());
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let safe = redactor.redact_headers(&headers);
        assert_eq!(safe["Authorization"], "[REDACTED]");
        assert_eq!(safe["Content-Type"], "application/json");
    }

    #[test]
    fn test_disabled_redaction_passes_through() {
        let config = RedactionConfig {
            enabled: false,
            ..RedactionConfig::default()
        };
        let redactor = SensitiveFieldRedactor::new(&config);
        assert_eq!(redactor.redact("password", "hunter2"), "hunter2");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.redaction.enabled);
        assert!(config.span_events.on_close);
    }
}
