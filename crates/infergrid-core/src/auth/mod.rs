//! Device token generation and validation for the dispatch handshake.
//!
//! Tokens are HMAC-SHA256 based, scoped to a (user id, device id) pair.
//! Format: `igrid_dt_<user_hex>_<device_hex>_<hmac_hex>` where the id
//! segments are hex-encoded UTF-8 so opaque identifiers containing
//! underscores cannot break the framing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix identifying infergrid device tokens.
const TOKEN_PREFIX: &str = "igrid_dt_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Build from the `INFERGRID_TOKEN_SECRET` environment variable,
    /// which must hold a hex-encoded secret.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("INFERGRID_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("INFERGRID_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The provider user this token authenticates.
    pub user_id: String,
    /// The device the connection claims to be.
    pub device_id: String,
}

/// Generate a device token for a (user, device) pair.
pub fn generate_device_token(config: &TokenConfig, user_id: &str, device_id: &str) -> String {
    let user_hex = hex::encode(user_id.as_bytes());
    let device_hex = hex::encode(device_id.as_bytes());
    let mac = compute_hmac(&config.secret, token_message(user_id, device_id).as_bytes());
    format!("{TOKEN_PREFIX}{user_hex}_{device_hex}_{}", hex::encode(mac))
}

/// Validate a device token and extract its claims.
pub fn validate_device_token(
    config: &TokenConfig,
    token: &str,
) -> Result<TokenClaims, TokenError> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("missing token prefix".to_owned()))?;

    let mut parts = rest.splitn(3, '_');
    let (user_hex, device_hex, mac_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(u), Some(d), Some(m)) => (u, d, m),
        _ => {
            return Err(TokenError::InvalidFormat(
                "expected three token segments".to_owned(),
            ));
        }
    };

    let user_id = decode_id_segment(user_hex)?;
    let device_id = decode_id_segment(device_hex)?;
    let mac = hex::decode(mac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("bad hmac hex: {e}")))?;

    let mut verifier = HmacSha256::new_from_slice(&config.secret)
        .expect("HMAC accepts keys of any length");
    verifier.update(token_message(&user_id, &device_id).as_bytes());
    verifier
        .verify_slice(&mac)
        .map_err(|_| TokenError::HmacMismatch)?;

    Ok(TokenClaims { user_id, device_id })
}

fn token_message(user_id: &str, device_id: &str) -> String {
    format!("{user_id}:{device_id}")
}

fn decode_id_segment(segment: &str) -> Result<String, TokenError> {
    let bytes = hex::decode(segment)
        .map_err(|e| TokenError::InvalidFormat(format!("bad id hex: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| TokenError::InvalidFormat(format!("id is not utf-8: {e}")))
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time string equality.
///
/// Used for ownership checks on lifecycle operations so a provider id
/// probe cannot time-leak how much of an identifier matched.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
