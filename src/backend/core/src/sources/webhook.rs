//! Push-based webhook source with HMAC signature verification.
//!
//! The HTTP layer is the host's: it hands each request's parsed payload, raw
//! body and headers to [`WebhookSource::handle_request`].

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Sha224, Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::event::{into_payload, Payload};
use super::lifecycle::{SourceCore, SourceKind};
use super::EventSource;
use crate::error::{Result, TributaryError};
use crate::telemetry::{SensitiveFieldRedactor, SourceMetrics};

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-GenXAI-Signature";

/// Webhook source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret; without one every request is accepted
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_header_name")]
    pub header_name: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            header_name: default_header_name(),
            algorithm: default_algorithm(),
        }
    }
}

impl WebhookConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// The secret, unless it is missing or blank.
    pub fn active_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

fn default_header_name() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

fn default_algorithm() -> String {
    "sha256".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Signatures
// ═══════════════════════════════════════════════════════════════════════════════

/// Digest used for the webhook HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl SignatureAlgorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Header value `"{alg}={hex digest}"` for `body` under `secret`.
    pub fn sign(&self, secret: &[u8], body: &[u8]) -> String {
        let digest = match self {
            Self::Sha224 => mac_bytes::<Hmac<Sha224>>(secret, body),
            Self::Sha256 => mac_bytes::<Hmac<Sha256>>(secret, body),
            Self::Sha384 => mac_bytes::<Hmac<Sha384>>(secret, body),
            Self::Sha512 => mac_bytes::<Hmac<Sha512>>(secret, body),
        };
        format!("{}={}", self.as_str(), hex::encode(digest))
    }

    /// Constant-time check of a raw tag against `body`.
    pub fn verify(&self, secret: &[u8], body: &[u8], tag: &[u8]) -> bool {
        match self {
            Self::Sha224 => verify_tag::<Hmac<Sha224>>(secret, body, tag),
            Self::Sha256 => verify_tag::<Hmac<Sha256>>(secret, body, tag),
            Self::Sha384 => verify_tag::<Hmac<Sha384>>(secret, body, tag),
            Self::Sha512 => verify_tag::<Hmac<Sha512>>(secret, body, tag),
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = TributaryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(TributaryError::invalid_configuration(format!(
                "Unsupported webhook signature algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn mac_bytes<M: Mac + hmac::digest::KeyInit>(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    match <M as Mac>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

fn verify_tag<M: Mac + hmac::digest::KeyInit>(secret: &[u8], body: &[u8], tag: &[u8]) -> bool {
    match <M as Mac>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            mac.verify_slice(tag).is_ok()
        }
        Err(_) => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Accepted,
    Rejected,
}

/// Outcome of one webhook request. A rejection is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source_id: String,
}

impl WebhookResponse {
    pub fn accepted(source_id: &str) -> Self {
        Self {
            status: WebhookStatus::Accepted,
            reason: None,
            source_id: source_id.to_string(),
        }
    }

    pub fn rejected(source_id: &str, reason: impl Into<String>) -> Self {
        Self {
            status: WebhookStatus::Rejected,
            reason: Some(reason.into()),
            source_id: source_id.to_string(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == WebhookStatus::Accepted
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════════════

/// Event source fed by inbound HTTP requests.
pub struct WebhookSource {
    core: SourceCore,
    config: WebhookConfig,
}

impl WebhookSource {
    pub fn new(id: impl Into<String>, config: WebhookConfig) -> Self {
        Self {
            core: SourceCore::new(id, SourceKind::Webhook),
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Check a `"{alg}={hex}"` signature against `body`.
    ///
    /// Always true when no secret is configured. Otherwise `signature` must
    /// be exactly the lowercase `"{alg}={hex}"` form produced by
    /// [`SignatureAlgorithm::sign`]; the digest is compared in constant time.
    pub fn validate_signature(&self, body: &[u8], signature: &str) -> bool {
        let Some(secret) = self.config.active_secret() else {
            return true;
        };
        let Ok(algorithm) = self.config.algorithm.parse::<SignatureAlgorithm>() else {
            return false;
        };
        let Some(digest) = signature
            .strip_prefix(algorithm.as_str())
            .and_then(|rest| rest.strip_prefix('='))
        else {
            return false;
        };
        if !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return false;
        }
        let Ok(tag) = hex::decode(digest) else {
            return false;
        };

        algorithm.verify(secret.as_bytes(), body, &tag)
    }

    /// Verify and emit one request.
    ///
    /// On acceptance the payload is emitted with `metadata.headers` set to the
    /// request headers. Subscriber failures propagate as errors.
    pub async fn handle_request(
        &self,
        payload: Value,
        raw_body: Option<&[u8]>,
        headers: &HashMap<String, String>,
    ) -> Result<WebhookResponse> {
        if let Some(reason) = self.rejection_reason(raw_body, headers) {
            SourceMetrics::webhook_request(self.core.id(), "rejected");
            tracing::warn!(
                source_id = %self.core.id(),
                reason = reason,
                headers = ?SensitiveFieldRedactor::global().redact_headers(headers),
                "Webhook request rejected"
            );
            return Ok(WebhookResponse::rejected(self.core.id(), reason));
        }

        SourceMetrics::webhook_request(self.core.id(), "accepted");

        let mut metadata = Payload::new();
        metadata.insert("headers".into(), json!(headers));
        self.core.emit(into_payload(payload), metadata).await?;

        Ok(WebhookResponse::accepted(self.core.id()))
    }

    fn rejection_reason(&self, raw_body: Option<&[u8]>, headers: &HashMap<String, String>) -> Option<&'static str> {
        self.config.active_secret()?;

        let Some(signature) = header_value(headers, &self.config.header_name) else {
            return Some("missing signature header");
        };
        let Some(body) = raw_body else {
            return Some("missing raw body for signature verification");
        };
        if !self.validate_signature(body, signature) {
            return Some("invalid signature");
        }
        None
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[async_trait]
impl EventSource for WebhookSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        if self.config.header_name.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Webhook", "header_name"));
        }
        self.config.algorithm.parse::<SignatureAlgorithm>()?;
        Ok(())
    }

    // Requests are pushed in; there is nothing to acquire.
    async fn start_acquisition(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sources::event::{subscriber_fn, ChannelSubscriber};
    use crate::sources::lifecycle::SourceStatus;

    const BODY: &[u8] = br#"{"hello":"world"}"#;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_known_sha256_vector() {
        // RFC 4231 test case 2
        let sig = SignatureAlgorithm::Sha256.sign(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_validate_signature() {
        let source = WebhookSource::new("hooks", WebhookConfig::with_secret("s"));
        let good = SignatureAlgorithm::Sha256.sign(b"s", BODY);

        assert!(source.validate_signature(BODY, &good));
        assert!(!source.validate_signature(b"{}", &good));
        assert!(!source.validate_signature(BODY, "sha256=deadbeef"));
        assert!(!source.validate_signature(BODY, "sha256=not-hex"));
        assert!(!source.validate_signature(BODY, &good.replacen("sha256", "sha512", 1)));
        assert!(!source.validate_signature(BODY, good.trim_start_matches("sha256=")));
    }

    #[test]
    fn test_signature_must_match_exactly() {
        let source = WebhookSource::new("hooks", WebhookConfig::with_secret("s"));
        let good = SignatureAlgorithm::Sha256.sign(b"s", BODY);
        let digest = good.trim_start_matches("sha256=");

        let variants = [
            format!("SHA256={}", digest),
            format!("sha256={}", digest.to_ascii_uppercase()),
            format!("  {}  ", good),
            format!("{}\n", good),
            format!("sha256 ={}", digest),
        ];
        for variant in &variants {
            assert!(!source.validate_signature(BODY, variant), "accepted {:?}", variant);
        }
        assert!(source.validate_signature(BODY, &good));
    }

    #[tokio::test]
    async fn test_blank_secret_means_unsigned() {
        for secret in ["", "   "] {
            let source = WebhookSource::new("open", WebhookConfig::with_secret(secret));
            assert!(source.config().active_secret().is_none());
            let response = source
                .handle_request(json!({"a": 1}), None, &HashMap::new())
                .await
                .unwrap();
            assert!(response.is_accepted(), "blank secret {:?} rejected", secret);
        }
    }

    #[test]
    fn test_other_algorithms_round_trip() {
        for alg in [SignatureAlgorithm::Sha224, SignatureAlgorithm::Sha384, SignatureAlgorithm::Sha512] {
            let config = WebhookConfig {
                algorithm: alg.to_string(),
                ..WebhookConfig::with_secret("k")
            };
            let source = WebhookSource::new("hooks", config);
            let sig = alg.sign(b"k", BODY);
            assert!(source.validate_signature(BODY, &sig), "{}", alg);
            assert!(!source.validate_signature(BODY, &SignatureAlgorithm::Sha256.sign(b"k", BODY)));
        }
    }

    #[test]
    fn test_unknown_algorithm_is_configuration_error() {
        let err = "md5".parse::<SignatureAlgorithm>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_response_serialization() {
        let rejected = serde_json::to_value(WebhookResponse::rejected("hooks", "invalid signature")).unwrap();
        assert_eq!(
            rejected,
            json!({"status": "rejected", "reason": "invalid signature", "sourceId": "hooks"})
        );
        let accepted = serde_json::to_value(WebhookResponse::accepted("hooks")).unwrap();
        assert_eq!(accepted, json!({"status": "accepted", "sourceId": "hooks"}));
    }

    #[tokio::test]
    async fn test_accepts_signed_request_and_emits_headers() {
        let source = WebhookSource::new("hooks", WebhookConfig::with_secret("s"));
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);

        let sig = SignatureAlgorithm::Sha256.sign(b"s", BODY);
        let hdrs = headers(&[("x-genxai-signature", sig.as_str()), ("content-type", "application/json")]);
        let response = source
            .handle_request(json!({"hello": "world"}), Some(BODY), &hdrs)
            .await
            .unwrap();

        assert!(response.is_accepted());
        let event = events.recv().await.unwrap();
        assert_eq!(event.payload["hello"], json!("world"));
        assert_eq!(event.metadata["headers"]["content-type"], json!("application/json"));
    }

    #[tokio::test]
    async fn test_rejections_do_not_emit() {
        let source = WebhookSource::new("hooks", WebhookConfig::with_secret("s"));
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);
        let sig = SignatureAlgorithm::Sha256.sign(b"s", BODY);

        let missing_header = source
            .handle_request(json!({}), Some(BODY), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(missing_header.reason.as_deref(), Some("missing signature header"));

        let missing_body = source
            .handle_request(json!({}), None, &headers(&[(DEFAULT_SIGNATURE_HEADER, sig.as_str())]))
            .await
            .unwrap();
        assert_eq!(missing_body.status, WebhookStatus::Rejected);

        let bad = source
            .handle_request(json!({}), Some(&b"tampered"[..]), &headers(&[(DEFAULT_SIGNATURE_HEADER, sig.as_str())]))
            .await
            .unwrap();
        assert_eq!(bad.reason.as_deref(), Some("invalid signature"));

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_secret_accepts_everything() {
        let source = WebhookSource::new("open", WebhookConfig::default());
        let response = source
            .handle_request(json!("ping"), None, &HashMap::new())
            .await
            .unwrap();
        assert!(response.is_accepted());
        assert_eq!(response.source_id, "open");
    }

    #[tokio::test]
    async fn test_subscriber_failure_propagates() {
        let source = WebhookSource::new("open", WebhookConfig::default());
        source.on_event(subscriber_fn(|_| async { Err(anyhow::anyhow!("nope")) }));

        let err = source
            .handle_request(json!({}), None, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubscriberFailed);
    }

    #[tokio::test]
    async fn test_invalid_algorithm_fails_start() {
        let config = WebhookConfig {
            algorithm: "md5".to_string(),
            ..WebhookConfig::default()
        };
        let source = WebhookSource::new("hooks", config);
        assert!(source.start().await.is_err());
        assert_eq!(source.status(), SourceStatus::Error);
    }
}
