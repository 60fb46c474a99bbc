//! Resolve a stored value that is itself a pointer into another system:
//! `parameter_store:<name>`, `gcp_secret_manager:<name>`, or
//! `cloudformation_export:<name>` (§4.3).
//!
//! AWS lookups go through `rusoto_ssm`/`rusoto_cloudformation`'s blocking
//! `.sync()` calls, matching `kms::AwsKms`. GCP Secret Manager has no
//! equivalent blocking `rusoto`-style crate so it is a hand-rolled `reqwest`
//! client, matching `kms::GcpKms`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Display};

use failure::{Backtrace, Context, Error, Fail};
use reqwest;
use rusoto_cloudformation::{
    CloudFormation, CloudFormationClient, DescribeStacksInput, DescribeStacksOutput,
};
use rusoto_core::Region;
use rusoto_ssm::{GetParameterRequest, Ssm, SsmClient};

use kms::Mode;
use Result;

const PARAMETER_STORE_PREFIX: &str = "parameter_store:";
const GCP_SECRET_MANAGER_PREFIX: &str = "gcp_secret_manager:";
const CLOUDFORMATION_EXPORT_PREFIX: &str = "cloudformation_export:";
const GCP_SECRET_MANAGER_BASE_URL: &str = "https://secretmanager.googleapis.com";

#[derive(Debug)]
pub struct IndirectionClientError {
    inner: Context<IndirectionErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum IndirectionErrKind {
    #[fail(display = "no `{}` parameter named {}", _0, _1)]
    NotFound(String, String),

    #[fail(display = "indirection lookup failed: {}", _0)]
    ProviderError(String),

    #[fail(display = "GOOGLE_OAUTH_ACCESS_TOKEN not specified")]
    MissingGcpToken,
}

impl Fail for IndirectionClientError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for IndirectionClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<IndirectionErrKind> for IndirectionClientError {
    fn from(kind: IndirectionErrKind) -> IndirectionClientError {
        IndirectionClientError { inner: Context::new(kind) }
    }
}
impl From<Context<IndirectionErrKind>> for IndirectionClientError {
    fn from(inner: Context<IndirectionErrKind>) -> IndirectionClientError {
        IndirectionClientError { inner }
    }
}

/// A reference to an externally-stored value, as recognized by its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndirectRef {
    ParameterStore(String),
    GcpSecretManager(String),
    CloudformationExport(String),
}

impl IndirectRef {
    /// Parses a raw value, returning `None` when it carries none of the
    /// recognized indirection prefixes (i.e. it's a literal value).
    pub fn parse(raw: &str) -> Option<IndirectRef> {
        if raw.starts_with(PARAMETER_STORE_PREFIX) {
            Some(IndirectRef::ParameterStore(raw[PARAMETER_STORE_PREFIX.len()..].to_string()))
        } else if raw.starts_with(GCP_SECRET_MANAGER_PREFIX) {
            Some(IndirectRef::GcpSecretManager(raw[GCP_SECRET_MANAGER_PREFIX.len()..].to_string()))
        } else if raw.starts_with(CLOUDFORMATION_EXPORT_PREFIX) {
            Some(IndirectRef::CloudformationExport(raw[CLOUDFORMATION_EXPORT_PREFIX.len()..].to_string()))
        } else {
            None
        }
    }
}

/// Resolves `IndirectRef`s against live cloud services, or against an
/// in-memory fixture in `Mode::Mocked`.
///
/// CloudFormation export values are cached for the lifetime of one
/// resolution pass (§4.3: a single `describe-stacks` paginated enumeration
/// services every export lookup in that pass), and the cache is dropped
/// entirely the moment any enumeration call fails so a later lookup in the
/// same pass retries rather than silently reusing a partial result.
pub struct Adapters {
    mode: Mode,
    region: Region,
    reqwest: reqwest::Client,
    gcp_secret_manager_base_url: String,
    mocked_params: BTreeMap<String, String>,
    mocked_secrets: BTreeMap<String, String>,
    mocked_exports: BTreeMap<String, String>,
    cfn_export_cache: RefCell<Option<BTreeMap<String, String>>>,
}

impl Adapters {
    pub fn live() -> Adapters {
        Adapters {
            mode: Mode::Live,
            region: Region::default(),
            reqwest: reqwest::Client::new(),
            gcp_secret_manager_base_url: GCP_SECRET_MANAGER_BASE_URL.to_string(),
            mocked_params: BTreeMap::new(),
            mocked_secrets: BTreeMap::new(),
            mocked_exports: BTreeMap::new(),
            cfn_export_cache: RefCell::new(None),
        }
    }

    pub fn mocked() -> Adapters {
        Adapters {
            mode: Mode::Mocked,
            region: Region::default(),
            reqwest: reqwest::Client::new(),
            gcp_secret_manager_base_url: GCP_SECRET_MANAGER_BASE_URL.to_string(),
            mocked_params: BTreeMap::new(),
            mocked_secrets: BTreeMap::new(),
            mocked_exports: BTreeMap::new(),
            cfn_export_cache: RefCell::new(None),
        }
    }

    #[cfg(test)]
    pub fn live_at(base_url: &str) -> Adapters {
        let mut adapters = Adapters::live();
        adapters.gcp_secret_manager_base_url = base_url.to_string();
        adapters
    }

    pub fn with_mocked_parameter(mut self, name: &str, value: &str) -> Adapters {
        self.mocked_params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_mocked_secret(mut self, name: &str, value: &str) -> Adapters {
        self.mocked_secrets.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_mocked_export(mut self, name: &str, value: &str) -> Adapters {
        self.mocked_exports.insert(name.to_string(), value.to_string());
        self
    }

    pub fn resolve(&self, indirect: &IndirectRef) -> Result<String> {
        match indirect {
            IndirectRef::ParameterStore(name) => self.parameter_store(name),
            IndirectRef::GcpSecretManager(name) => self.gcp_secret_manager(name),
            IndirectRef::CloudformationExport(name) => self.cloudformation_export(name),
        }
    }

    fn parameter_store(&self, name: &str) -> Result<String> {
        if self.mode == Mode::Mocked {
            return self.mocked_params.get(name).cloned().ok_or_else(|| {
                Error::from(IndirectionErrKind::NotFound("parameter_store".to_string(), name.to_string()))
            });
        }
        let client = SsmClient::new(self.region.clone());
        let req = GetParameterRequest { name: name.to_string(), with_decryption: Some(true) };
        let resp = client
            .get_parameter(req)
            .sync()
            .map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))?;
        resp.parameter
            .and_then(|p| p.value)
            .ok_or_else(|| Error::from(IndirectionErrKind::NotFound("parameter_store".to_string(), name.to_string())))
    }

    fn gcp_secret_manager(&self, name: &str) -> Result<String> {
        if self.mode == Mode::Mocked {
            return self.mocked_secrets.get(name).cloned().ok_or_else(|| {
                Error::from(IndirectionErrKind::NotFound("gcp_secret_manager".to_string(), name.to_string()))
            });
        }
        let token = ::std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .map_err(|_| Error::from(IndirectionErrKind::MissingGcpToken))?;
        let url = format!("{}/v1/{}:access", self.gcp_secret_manager_base_url, name);
        let mut res = self
            .reqwest
            .get(&url)
            .bearer_auth(token)
            .send()
            .map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))?;
        if !res.status().is_success() {
            return Err(Error::from(IndirectionErrKind::NotFound(
                "gcp_secret_manager".to_string(),
                name.to_string(),
            )));
        }
        let parsed: ::serde_json::Value =
            res.json().map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))?;
        let data_b64 = parsed
            .get("payload")
            .and_then(|p| p.get("data"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::from(IndirectionErrKind::NotFound("gcp_secret_manager".to_string(), name.to_string())))?;
        let decoded = ::base64::decode(data_b64)
            .map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))?;
        String::from_utf8(decoded).map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))
    }

    fn cloudformation_export(&self, name: &str) -> Result<String> {
        if self.mode == Mode::Mocked {
            return self.mocked_exports.get(name).cloned().ok_or_else(|| {
                Error::from(IndirectionErrKind::NotFound("cloudformation_export".to_string(), name.to_string()))
            });
        }
        if self.cfn_export_cache.borrow().is_none() {
            match self.enumerate_exports() {
                Ok(exports) => {
                    *self.cfn_export_cache.borrow_mut() = Some(exports);
                }
                Err(e) => {
                    *self.cfn_export_cache.borrow_mut() = None;
                    return Err(e);
                }
            }
        }
        let cache = self.cfn_export_cache.borrow();
        cache
            .as_ref()
            .and_then(|exports| exports.get(name).cloned())
            .ok_or_else(|| Error::from(IndirectionErrKind::NotFound("cloudformation_export".to_string(), name.to_string())))
    }

    fn enumerate_exports(&self) -> Result<BTreeMap<String, String>> {
        let client = CloudFormationClient::new(self.region.clone());
        let mut exports = BTreeMap::new();
        let mut next_token: Option<String> = None;
        loop {
            let req = DescribeStacksInput { next_token: next_token.clone(), ..Default::default() };
            let resp: DescribeStacksOutput = client
                .describe_stacks(req)
                .sync()
                .map_err(|e| Error::from(IndirectionErrKind::ProviderError(e.to_string())))?;
            for stack in resp.stacks.unwrap_or_default() {
                for export in stack.outputs.unwrap_or_default() {
                    if let (Some(key), Some(value)) = (export.export_name, export.output_value) {
                        exports.insert(key, value);
                    }
                }
            }
            next_token = resp.next_token;
            if next_token.is_none() {
                break;
            }
        }
        Ok(exports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_prefixes() {
        assert_eq!(
            IndirectRef::parse("parameter_store:/app/db/password"),
            Some(IndirectRef::ParameterStore("/app/db/password".to_string()))
        );
        assert_eq!(
            IndirectRef::parse("gcp_secret_manager:projects/p/secrets/s/versions/latest"),
            Some(IndirectRef::GcpSecretManager("projects/p/secrets/s/versions/latest".to_string()))
        );
        assert_eq!(
            IndirectRef::parse("cloudformation_export:VpcId"),
            Some(IndirectRef::CloudformationExport("VpcId".to_string()))
        );
        assert_eq!(IndirectRef::parse("plain-value"), None);
    }

    #[test]
    fn mocked_parameter_store_round_trips() {
        let adapters = Adapters::mocked().with_mocked_parameter("/app/db/password", "hunter2");
        let value = adapters
            .resolve(&IndirectRef::ParameterStore("/app/db/password".to_string()))
            .unwrap();
        assert_eq!(value, "hunter2");
    }

    #[test]
    fn mocked_missing_parameter_fails() {
        let adapters = Adapters::mocked();
        let err = adapters
            .resolve(&IndirectRef::ParameterStore("/missing".to_string()))
            .unwrap_err();
        assert!(format!("{}", err).contains("/missing"));
    }

    #[test]
    fn mocked_cloudformation_export_round_trips() {
        let adapters = Adapters::mocked().with_mocked_export("VpcId", "vpc-1234");
        let value = adapters
            .resolve(&IndirectRef::CloudformationExport("VpcId".to_string()))
            .unwrap();
        assert_eq!(value, "vpc-1234");
    }

    /// Exercises the real GCP Secret Manager HTTP request/response handling
    /// against a `mockito` server, rather than the `Mode::Mocked` fixture the
    /// other GCP test above uses.
    #[test]
    fn gcp_secret_manager_live_fetch_against_mock_server() {
        ::std::env::set_var("GOOGLE_OAUTH_ACCESS_TOKEN", "fake-token");
        let name = "projects/p/secrets/s/versions/latest";

        let _mock = mockito::mock("GET", format!("/v1/{}:access", name).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"payload": {"data": "aHVudGVyMg=="}}"#)
            .create();

        let adapters = Adapters::live_at(&mockito::server_url());
        let value = adapters.resolve(&IndirectRef::GcpSecretManager(name.to_string())).unwrap();
        assert_eq!(value, "hunter2");
    }

    #[test]
    fn gcp_secret_manager_live_surfaces_missing_secret() {
        ::std::env::set_var("GOOGLE_OAUTH_ACCESS_TOKEN", "fake-token");
        let name = "projects/p/secrets/missing/versions/latest";

        let _mock = mockito::mock("GET", format!("/v1/{}:access", name).as_str())
            .with_status(404)
            .create();

        let adapters = Adapters::live_at(&mockito::server_url());
        let err = adapters
            .resolve(&IndirectRef::GcpSecretManager(name.to_string()))
            .unwrap_err();
        assert!(format!("{}", err).contains(name));
    }
}
