//! Signed blob-store URLs for model/tensor uploads and reads.
//!
//! The object store itself is an external collaborator; the server only
//! mints time-limited HMAC-signed URLs against its base address and
//! verifies them when asked. Signature input is `<verb>:<path>:<expiry>`
//! so a PUT grant cannot be replayed as a GET or onto another blob.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// What kind of blob an upload URL is for. Wire values are numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Model,
    Input,
    Output,
}

impl FileKind {
    /// Decode the intake contract's numeric file type.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Model),
            1 => Some(Self::Input),
            2 => Some(Self::Output),
            _ => None,
        }
    }

    fn dir(self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Input => "inputs",
            Self::Output => "outputs",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// A freshly minted pair of signed URLs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUpload {
    pub upload_url: String,
    pub read_url: String,
    pub expires_at_utc: DateTime<Utc>,
}

/// Signs and verifies blob URLs against one store/container pair.
#[derive(Debug, Clone)]
pub struct UploadSigner {
    base_url: String,
    container: String,
    secret: Vec<u8>,
    ttl: Duration,
}

impl UploadSigner {
    pub fn new(base_url: &str, container: &str, secret: Vec<u8>, ttl: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            container: container.to_owned(),
            secret,
            ttl,
        }
    }

    /// Mint a signed PUT URL plus the matching read URL for a new blob.
    pub fn sign_upload(&self, kind: FileKind, file_name: &str) -> SignedUpload {
        let expires_at = Utc::now() + self.ttl;
        let path = format!("{}/{}/{}", self.container, kind.dir(), file_name);
        SignedUpload {
            upload_url: self.signed_url("PUT", &path, expires_at),
            read_url: self.signed_url("GET", &path, expires_at),
            expires_at_utc: expires_at,
        }
    }

    /// Mint a signed read URL for an existing blob path or URI.
    ///
    /// Absolute URIs (already fetchable) pass through untouched; store
    /// paths like `inference/models/m.onnx` get signed.
    pub fn sign_read(&self, uri_or_path: &str) -> String {
        if uri_or_path.starts_with("http://") || uri_or_path.starts_with("https://") {
            return uri_or_path.to_owned();
        }
        let path = uri_or_path
            .strip_prefix("blob://")
            .unwrap_or(uri_or_path)
            .trim_start_matches('/');
        self.signed_url("GET", path, Utc::now() + self.ttl)
    }

    /// Verify a signature produced by this signer.
    pub fn verify(&self, verb: &str, path: &str, expires: i64, signature_hex: &str) -> bool {
        if Utc::now().timestamp() > expires {
            return false;
        }
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(message(verb, path, expires).as_bytes());
        mac.verify_slice(&signature).is_ok()
    }

    fn signed_url(&self, verb: &str, path: &str, expires_at: DateTime<Utc>) -> String {
        let expires = expires_at.timestamp();
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(message(verb, path, expires).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!(
            "{}/{}?verb={}&expires={}&sig={}",
            self.base_url,
            path,
            verb.to_ascii_lowercase(),
            expires,
            signature
        )
    }
}

fn message(verb: &str, path: &str, expires: i64) -> String {
    format!("{}:{}:{}", verb.to_ascii_uppercase(), path, expires)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UploadSigner {
        UploadSigner::new(
            "https://blobs.example.test",
            "inference",
            b"upload-test-secret".to_vec(),
            Duration::from_secs(900),
        )
    }

    #[test]
    fn file_kind_wire_values() {
        assert_eq!(FileKind::from_wire(0), Some(FileKind::Model));
        assert_eq!(FileKind::from_wire(1), Some(FileKind::Input));
        assert_eq!(FileKind::from_wire(2), Some(FileKind::Output));
        assert_eq!(FileKind::from_wire(3), None);
    }

    #[test]
    fn upload_urls_verify() {
        let signer = signer();
        let signed = signer.sign_upload(FileKind::Model, "resnet50.onnx");

        assert!(signed.upload_url.contains("/inference/models/resnet50.onnx?"));
        assert!(signed.upload_url.contains("verb=put"));
        assert!(signed.read_url.contains("verb=get"));

        let expires = signed.expires_at_utc.timestamp();
        let sig = signed
            .upload_url
            .rsplit("sig=")
            .next()
            .expect("upload url has a signature");
        assert!(signer.verify("PUT", "inference/models/resnet50.onnx", expires, sig));
        assert!(
            !signer.verify("GET", "inference/models/resnet50.onnx", expires, sig),
            "a PUT grant must not verify as GET"
        );
        assert!(
            !signer.verify("PUT", "inference/models/other.onnx", expires, sig),
            "signatures are path-bound"
        );
    }

    #[test]
    fn expired_signature_rejected() {
        let signer = signer();
        let expires = Utc::now().timestamp() - 10;
        let mut mac = HmacSha256::new_from_slice(b"upload-test-secret").unwrap();
        mac.update(message("GET", "inference/models/m.onnx", expires).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!signer.verify("GET", "inference/models/m.onnx", expires, &sig));
    }

    #[test]
    fn read_passthrough_for_absolute_uris() {
        let signer = signer();
        let url = "https://elsewhere.example/m.onnx";
        assert_eq!(signer.sign_read(url), url);

        let signed = signer.sign_read("blob://inference/models/m.onnx");
        assert!(signed.starts_with("https://blobs.example.test/inference/models/m.onnx?"));
        assert!(signed.contains("verb=get"));
    }
}
