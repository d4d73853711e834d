//! Webhook signature verification
//!
//! Deliveries carry `X-Hub-Signature-256: sha256=<hex>`, an HMAC-SHA256 of
//! the raw request body keyed by the app secret. Several secrets may be
//! configured at once while a secret is being rotated.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct SignatureVerifier {
    secrets: Vec<String>,
}

impl SignatureVerifier {
    pub fn new(secrets: Vec<String>) -> Self {
        let secrets = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        Self { secrets }
    }

    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Check `header` against the exact wire bytes of the body.
    ///
    /// Fails closed: a missing header, an empty body, a malformed digest or
    /// an empty secret list all yield `false`.
    pub fn verify(&self, body: &[u8], header: Option<&str>) -> bool {
        let Some(header) = header else {
            tracing::debug!("Webhook delivery has no signature header");
            return false;
        };
        if body.is_empty() || self.secrets.is_empty() {
            return false;
        }
        let Some(expected) = decode_signature(header) else {
            tracing::debug!("Webhook signature header is malformed");
            return false;
        };

        for (secret_index, secret) in self.secrets.iter().enumerate() {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                continue;
            };
            mac.update(body);
            // verify_slice compares in constant time
            if mac.verify_slice(&expected).is_ok() {
                tracing::debug!(secret_index, "Webhook signature verified");
                return true;
            }
        }

        tracing::warn!(
            secrets = self.secrets.len(),
            "Webhook signature did not match any configured secret"
        );
        false
    }
}

fn decode_signature(header: &str) -> Option<Vec<u8>> {
    let digest = header.trim().strip_prefix("sha256=")?;
    let bytes = hex::decode(digest).ok()?;
    (bytes.len() == 32).then_some(bytes)
}

/// Compute the header value for `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
