use std::env;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Server configuration read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base URL of the object store holding models and tensors.
    pub blob_store_url: String,
    /// Container/bucket for inference blobs.
    pub inference_container: String,
    /// TTL for signed upload/read URLs.
    pub upload_url_ttl: Duration,
    /// Secret for device tokens and blob URL signatures.
    pub token_secret: Vec<u8>,
}

impl ServerConfig {
    /// Build from the environment.
    ///
    /// `INFERGRID_TOKEN_SECRET` must be hex; when absent or invalid an
    /// ephemeral secret is generated (tokens then die with the process),
    /// which is fine for development and wrong for production.
    pub fn from_env() -> Self {
        let blob_store_url = env::var("INFERGRID_BLOB_STORE_URL")
            .unwrap_or_else(|_| "http://localhost:9000".to_owned());
        let inference_container =
            env::var("INFERGRID_INFERENCE_CONTAINER").unwrap_or_else(|_| "inference".to_owned());
        let ttl_minutes = env::var("INFERGRID_UPLOAD_URL_TTL_MINUTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(15);

        let token_secret = match env::var("INFERGRID_TOKEN_SECRET") {
            Ok(hex_secret) => match hex::decode(&hex_secret) {
                Ok(secret) if !secret.is_empty() => secret,
                _ => {
                    warn!("INFERGRID_TOKEN_SECRET is not valid hex, using an ephemeral secret");
                    ephemeral_secret()
                }
            },
            Err(_) => {
                warn!("INFERGRID_TOKEN_SECRET unset, using an ephemeral secret");
                ephemeral_secret()
            }
        };

        Self {
            blob_store_url,
            inference_container,
            upload_url_ttl: Duration::from_secs(ttl_minutes * 60),
            token_secret,
        }
    }
}

fn ephemeral_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::rng().fill(&mut secret[..]);
    secret
}
