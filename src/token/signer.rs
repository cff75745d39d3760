//! Request signer (§6: "the specific signing scheme is an external concern;
//! the core only passes the credentials to a signer function").
//!
//! [`HmacSigner`] is a default implementation good enough to drive the
//! crate's own tests and examples end-to-end; production deployments are
//! expected to supply their own [`Signer`] (e.g. OAuth 1.0a) via
//! [`crate::token::TokenProviderConfig::signer`].

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::Credentials;

/// Produces the `Authorization` header value for the signed
/// `POST /oauth2/token` request, given the credentials and the request
/// timestamp computed per §4.3 step 1.
pub trait Signer: Send + Sync {
    /// Build the authorization header value.
    fn sign(&self, credentials: &Credentials, timestamp: DateTime<Utc>, nonce: &str) -> String;
}

/// HMAC-SHA256-over-timestamp signer: `HMAC(secret, "<client_id>:<nonce>:<unix_ts>")`,
/// base64-encoded, presented as `OLP-HMAC-SHA256 <client_id>:<nonce>:<ts>:<sig>`.
///
/// This mirrors the shape (not the exact byte layout) of the OAuth 1.0a-style
/// signed header described in §6, without depending on an external crate for
/// full OAuth 1.0a — which is explicitly out of scope for this core.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSigner;

impl Signer for HmacSigner {
    fn sign(&self, credentials: &Credentials, timestamp: DateTime<Utc>, nonce: &str) -> String {
        let ts = timestamp.timestamp();
        let payload = format!("{}:{}:{}", credentials.client_id, nonce, ts);
        let mut mac = Hmac::<Sha256>::new_from_slice(credentials.client_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();
        let encoded = general_purpose::STANDARD.encode(signature);
        format!(
            "OLP-HMAC-SHA256 {}:{}:{}:{}",
            credentials.client_id, nonce, ts, encoded
        )
    }
}
