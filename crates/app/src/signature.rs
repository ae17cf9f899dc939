use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

const SECRET_PREFIX: &str = "whsec_";

/// Maximum allowed clock difference between the delivery timestamp and now.
/// Symmetric, so clock-skewed-future timestamps are rejected like stale ones.
pub const FRESHNESS_WINDOW_SECS: i64 = 5 * 60;

/// Errors that can occur while verifying a webhook delivery.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("invalid timestamp format: {0}")]
    MalformedTimestamp(String),
    #[error("timestamp outside the allowed window ({skew_seconds}s skew)")]
    TimestampOutOfRange { skew_seconds: i64 },
    #[error("failed to initialize signature verifier")]
    MacInit,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifier for the Standard Webhooks signature scheme used by Polar.
///
/// The shared secret is normalized once at construction; per-request work is
/// a timestamp check plus an HMAC over `{id}.{timestamp}.{body}`.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Option<Vec<u8>>,
}

impl WebhookVerifier {
    /// Builds a verifier from the configured secret, accepting the raw,
    /// base64-encoded, or `whsec_`-prefixed form interchangeably.
    pub fn from_secret(secret: Option<&str>) -> Self {
        let key = secret
            .map(normalize_secret)
            .map(|normalized| decode_key(&normalized));
        Self { key }
    }

    /// Returns `true` when a secret is configured.
    pub fn has_secret(&self) -> bool {
        self.key.is_some()
    }

    /// Verifies one delivery.
    ///
    /// The signature header may carry several space-separated `v1,<base64>`
    /// entries; verification succeeds if any one matches.
    pub fn verify(
        &self,
        message_id: &str,
        timestamp: &str,
        signature_header: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let key = self.key.as_ref().ok_or(SignatureError::MissingSecret)?;

        let delivered_at = parse_timestamp(timestamp)?;
        let skew_seconds = now.signed_duration_since(delivered_at).num_seconds().abs();
        if skew_seconds > FRESHNESS_WINDOW_SECS {
            return Err(SignatureError::TimestampOutOfRange { skew_seconds });
        }

        let expected = compute_signature(key, message_id, timestamp, body)?;
        for entry in signature_header.split_ascii_whitespace() {
            let Some((version, encoded)) = entry.split_once(',') else {
                continue;
            };
            if version != "v1" {
                continue;
            }
            let Ok(provided) = BASE64.decode(encoded) else {
                continue;
            };
            if expected.as_slice().ct_eq(provided.as_slice()).into() {
                return Ok(());
            }
        }

        Err(SignatureError::Mismatch)
    }
}

/// Normalizes a configured secret into the `whsec_`-prefixed base64 form.
///
/// Secrets arrive via plain environment configuration in any of three shapes;
/// already-prefixed values pass through, bare base64 gains the prefix, and
/// raw text is base64-encoded first. Applying this twice is a no-op.
pub fn normalize_secret(secret: &str) -> String {
    if secret.starts_with(SECRET_PREFIX) {
        secret.to_string()
    } else if BASE64.decode(secret).is_ok() {
        format!("{SECRET_PREFIX}{secret}")
    } else {
        format!("{SECRET_PREFIX}{}", BASE64.encode(secret.as_bytes()))
    }
}

fn decode_key(normalized: &str) -> Vec<u8> {
    let encoded = normalized.strip_prefix(SECRET_PREFIX).unwrap_or(normalized);
    BASE64
        .decode(encoded)
        .unwrap_or_else(|_| encoded.as_bytes().to_vec())
}

fn compute_signature(
    key: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<Vec<u8>, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| SignatureError::MacInit)?;
    mac.update(message_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SignatureError> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return Utc
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| SignatureError::MalformedTimestamp(raw.to_string()));
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SignatureError::MalformedTimestamp(raw.to_string()))
}
