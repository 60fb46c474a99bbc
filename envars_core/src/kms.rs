//! Encrypt/decrypt a plaintext string under a cloud KMS key with an
//! authenticated additional-data context (§4.2).
//!
//! Neither AWS nor GCP has an official blocking-style Rust SDK from this era
//! that fits the crate's synchronous design, so both adapters are hand-rolled
//! clients in the shape of `vault::Vault`: a small struct wrapping a
//! `Mode` (`Live`/`Mocked`) for hermetic tests, built directly over a blocking
//! transport rather than a generated client (§4.2.1 REDESIGN). AWS gets the
//! closest real equivalent, `rusoto_kms`'s blocking `.sync()` call style; GCP
//! talks to Cloud KMS's REST API directly over `reqwest`, the same shape
//! `vault::Vault` uses for Vault's HTTP API.

use std::collections::BTreeMap;
use std::env;
use std::fmt::{self, Display};

use base64;
use failure::{Backtrace, Context, Error, Fail};
use reqwest;
use rusoto_core::Region;
use rusoto_kms::{DecryptRequest, EncryptRequest, Kms, KmsClient};
use serde_json;

use Result;

#[derive(Debug)]
pub struct KmsClientError {
    inner: Context<KmsErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum KmsErrKind {
    #[fail(display = "KMS provider call failed: {}", _0)]
    ProviderError(String),

    #[fail(display = "ciphertext or encryption context mismatch")]
    DecryptError,

    #[fail(display = "GCP KMS decrypt requires the key path to be supplied")]
    MissingKeyPath,

    #[fail(display = "GOOGLE_OAUTH_ACCESS_TOKEN not specified")]
    MissingGcpToken,
}

impl Fail for KmsClientError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for KmsClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<KmsErrKind> for KmsClientError {
    fn from(kind: KmsErrKind) -> KmsClientError {
        KmsClientError { inner: Context::new(kind) }
    }
}
impl From<Context<KmsErrKind>> for KmsClientError {
    fn from(inner: Context<KmsErrKind>) -> KmsClientError {
        KmsClientError { inner }
    }
}

/// KMS operation mode, mirroring `vault::Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Mocked,
}

/// The `{app, env?, location?}` authenticated context bound to a binding's
/// scope (§4.2, mandatory encryption context binding).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionContext {
    pub app: String,
    pub env: Option<String>,
    pub location: Option<String>,
}

impl EncryptionContext {
    /// As a `label -> value` map, the shape both providers want for additional
    /// authenticated data.
    pub fn as_map(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("app".to_string(), self.app.clone());
        if let Some(e) = &self.env {
            m.insert("env".to_string(), e.clone());
        }
        if let Some(l) = &self.location {
            m.insert("location".to_string(), l.clone());
        }
        m
    }

    /// GCP wants additional authenticated data as canonical JSON with sorted
    /// keys; a `BTreeMap` already iterates in sorted key order so `serde_json`
    /// gives us that for free.
    fn canonical_json(&self) -> String {
        serde_json::to_string(&self.as_map()).expect("BTreeMap<String, String> always serializes")
    }
}

pub trait KmsAdapter {
    fn encrypt(&self, plaintext: &str, key_id: &str, ctx: &EncryptionContext) -> Result<String>;
    fn decrypt(&self, ciphertext_b64: &str, key_id: &str, ctx: &EncryptionContext) -> Result<String>;
}

/// AWS KMS, talked to via `rusoto_kms`'s blocking `.sync()` calls.
pub struct AwsKms {
    mode: Mode,
    region: Region,
}

impl AwsKms {
    pub fn live() -> AwsKms {
        AwsKms { mode: Mode::Live, region: Region::default() }
    }

    pub fn mocked() -> AwsKms {
        AwsKms { mode: Mode::Mocked, region: Region::default() }
    }
}

impl KmsAdapter for AwsKms {
    fn encrypt(&self, plaintext: &str, key_id: &str, ctx: &EncryptionContext) -> Result<String> {
        if self.mode == Mode::Mocked {
            return Ok(mocked_envelope(plaintext, ctx));
        }
        let client = KmsClient::new(self.region.clone());
        let req = EncryptRequest {
            key_id: key_id.to_string(),
            plaintext: plaintext.as_bytes().to_vec().into(),
            encryption_context: Some(ctx.as_map()),
            ..Default::default()
        };
        let resp = client
            .encrypt(req)
            .sync()
            .map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        let blob = resp.ciphertext_blob.ok_or_else(|| Error::from(KmsErrKind::ProviderError(
            "AWS KMS returned no ciphertext".to_string(),
        )))?;
        Ok(base64::encode(&blob))
    }

    fn decrypt(&self, ciphertext_b64: &str, _key_id: &str, ctx: &EncryptionContext) -> Result<String> {
        if self.mode == Mode::Mocked {
            return decode_mocked_envelope(ciphertext_b64, ctx);
        }
        let decoded = base64::decode(ciphertext_b64)
            .map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        let client = KmsClient::new(self.region.clone());
        let req = DecryptRequest {
            ciphertext_blob: decoded.into(),
            encryption_context: Some(ctx.as_map()),
            ..Default::default()
        };
        let resp = client.decrypt(req).sync().map_err(|e| {
            Error::from(KmsErrKind::ProviderError(e.to_string()))
        })?;
        let plaintext = resp.plaintext.ok_or_else(|| Error::from(KmsErrKind::DecryptError))?;
        String::from_utf8(plaintext.to_vec()).map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))
    }
}

const GCP_KMS_BASE_URL: &str = "https://cloudkms.googleapis.com";

/// Google Cloud KMS, talked to directly over its REST API since no blocking
/// official SDK exists for this era (§4.2.1 REDESIGN).
pub struct GcpKms {
    mode: Mode,
    client: reqwest::Client,
    /// The API root, `Vault::addr`-style: the real endpoint in `live()`, a
    /// `mockito` server URL in tests that exercise the actual HTTP path.
    base_url: String,
}

impl GcpKms {
    pub fn live() -> GcpKms {
        GcpKms { mode: Mode::Live, client: reqwest::Client::new(), base_url: GCP_KMS_BASE_URL.to_string() }
    }

    pub fn mocked() -> GcpKms {
        GcpKms { mode: Mode::Mocked, client: reqwest::Client::new(), base_url: GCP_KMS_BASE_URL.to_string() }
    }

    /// `Mode::Live` against an arbitrary endpoint, for tests that stand up a
    /// `mockito` server and need the real request/response handling exercised.
    #[cfg(test)]
    pub fn live_at(base_url: &str) -> GcpKms {
        GcpKms { mode: Mode::Live, client: reqwest::Client::new(), base_url: base_url.to_string() }
    }

    fn access_token(&self) -> Result<String> {
        env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .map_err(|_| Error::from(KmsErrKind::MissingGcpToken))
    }
}

impl KmsAdapter for GcpKms {
    fn encrypt(&self, plaintext: &str, key_id: &str, ctx: &EncryptionContext) -> Result<String> {
        if self.mode == Mode::Mocked {
            return Ok(mocked_envelope(plaintext, ctx));
        }
        let token = self.access_token()?;
        let aad = ctx.canonical_json();
        let url = format!("{}/v1/{}:encrypt", self.base_url, key_id);
        let body = serde_json::json!({
            "plaintext": base64::encode(plaintext.as_bytes()),
            "additionalAuthenticatedData": base64::encode(aad.as_bytes()),
        });
        let mut res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        if !res.status().is_success() {
            return Err(Error::from(KmsErrKind::ProviderError(format!(
                "GCP KMS returned HTTP {}",
                res.status()
            ))));
        }
        let parsed: serde_json::Value =
            res.json().map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        parsed
            .get("ciphertext")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::from(KmsErrKind::ProviderError("GCP KMS returned no ciphertext".to_string())))
    }

    fn decrypt(&self, ciphertext_b64: &str, key_id: &str, ctx: &EncryptionContext) -> Result<String> {
        if key_id.is_empty() {
            return Err(Error::from(KmsErrKind::MissingKeyPath));
        }
        if self.mode == Mode::Mocked {
            return decode_mocked_envelope(ciphertext_b64, ctx);
        }
        let token = self.access_token()?;
        let aad = ctx.canonical_json();
        let url = format!("{}/v1/{}:decrypt", self.base_url, key_id);
        let body = serde_json::json!({
            "ciphertext": ciphertext_b64,
            "additionalAuthenticatedData": base64::encode(aad.as_bytes()),
        });
        let mut res = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        if !res.status().is_success() {
            return Err(Error::from(KmsErrKind::DecryptError));
        }
        let parsed: serde_json::Value =
            res.json().map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        let plaintext_b64 = parsed
            .get("plaintext")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::from(KmsErrKind::DecryptError))?;
        let decoded =
            base64::decode(plaintext_b64).map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
        String::from_utf8(decoded).map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))
    }
}

/// `Mode::Mocked` envelope: the context is folded into the "ciphertext" itself
/// so a mismatched context at decrypt time still fails, without ever touching
/// the network — this is what makes the resolver hermetic in tests while still
/// exercising the context-binding invariant (§8, scenario 4).
fn mocked_envelope(plaintext: &str, ctx: &EncryptionContext) -> String {
    let envelope = serde_json::json!({ "pt": plaintext, "ctx": ctx.as_map() });
    base64::encode(envelope.to_string().as_bytes())
}

fn decode_mocked_envelope(ciphertext_b64: &str, ctx: &EncryptionContext) -> Result<String> {
    let raw = base64::decode(ciphertext_b64).map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
    let text = String::from_utf8(raw).map_err(|e| Error::from(KmsErrKind::ProviderError(e.to_string())))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|_| Error::from(KmsErrKind::DecryptError))?;
    let stored_ctx = parsed.get("ctx").cloned().unwrap_or(serde_json::Value::Null);
    let expected_ctx = serde_json::to_value(ctx.as_map()).expect("map always serializes");
    if stored_ctx != expected_ctx {
        return Err(Error::from(KmsErrKind::DecryptError));
    }
    parsed
        .get("pt")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::from(KmsErrKind::DecryptError))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(env: Option<&str>, location: Option<&str>) -> EncryptionContext {
        EncryptionContext {
            app: "demo".to_string(),
            env: env.map(str::to_string),
            location: location.map(str::to_string),
        }
    }

    #[test]
    fn mocked_round_trip() {
        let kms = AwsKms::mocked();
        let c = ctx(Some("dev"), Some("aws"));
        let ciphertext = kms.encrypt("hunter2", "arn:aws:kms:fake", &c).unwrap();
        let plaintext = kms.decrypt(&ciphertext, "arn:aws:kms:fake", &c).unwrap();
        assert_eq!(plaintext, "hunter2");
    }

    #[test]
    fn mocked_context_mismatch_fails() {
        let kms = AwsKms::mocked();
        let encrypt_ctx = ctx(Some("dev"), Some("aws"));
        let ciphertext = kms.encrypt("hunter2", "arn:aws:kms:fake", &encrypt_ctx).unwrap();
        let wrong_ctx = ctx(Some("dev"), Some("gcp"));
        assert!(kms.decrypt(&ciphertext, "arn:aws:kms:fake", &wrong_ctx).is_err());
    }

    #[test]
    fn gcp_decrypt_requires_key_path() {
        let kms = GcpKms::mocked();
        let c = ctx(None, None);
        let err = kms.decrypt("anything", "", &c).unwrap_err();
        assert!(format!("{}", err).contains("key path"));
    }

    /// Exercises `GcpKms`'s actual HTTP request/response handling (request
    /// shape, bearer auth, JSON field extraction) against a `mockito` server,
    /// rather than the `Mode::Mocked` envelope every other GCP test here uses.
    #[test]
    fn gcp_live_encrypt_decrypt_round_trip_against_mock_server() {
        env::set_var("GOOGLE_OAUTH_ACCESS_TOKEN", "fake-token");
        let key_id = "projects/p/locations/l/keyRings/r/cryptoKeys/k";
        let c = ctx(Some("dev"), Some("aws"));

        let _encrypt_mock = mockito::mock("POST", format!("/v1/{}:encrypt", key_id).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ciphertext": "Y2lwaGVydGV4dA=="}"#)
            .create();

        let kms = GcpKms::live_at(&mockito::server_url());
        let ciphertext = kms.encrypt("hunter2", key_id, &c).unwrap();
        assert_eq!(ciphertext, "Y2lwaGVydGV4dA==");

        let _decrypt_mock = mockito::mock("POST", format!("/v1/{}:decrypt", key_id).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"plaintext": "aHVudGVyMg=="}"#)
            .create();

        let plaintext = kms.decrypt(&ciphertext, key_id, &c).unwrap();
        assert_eq!(plaintext, "hunter2");
    }

    #[test]
    fn gcp_live_decrypt_surfaces_http_failure_as_decrypt_error() {
        env::set_var("GOOGLE_OAUTH_ACCESS_TOKEN", "fake-token");
        let key_id = "projects/p/locations/l/keyRings/r/cryptoKeys/k";
        let c = ctx(None, None);

        let _mock = mockito::mock("POST", format!("/v1/{}:decrypt", key_id).as_str())
            .with_status(403)
            .create();

        let kms = GcpKms::live_at(&mockito::server_url());
        let err = kms.decrypt("Y2lwaGVydGV4dA==", key_id, &c).unwrap_err();
        assert!(format!("{}", err).contains("mismatch"));
    }
}
