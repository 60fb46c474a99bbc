//! Edit a `Document` in the ways the CLI exposes: add or update a binding
//! (`add`), and re-encrypt every secret under a new KMS key (`rotate-kms-key`).
//!
//! Both operations are defensive by construction: they validate their inputs
//! up front and leave `doc` untouched on any rejection, rather than partially
//! applying a change and relying on the caller to discard it.

use std::fmt::{self, Display};

use failure::{Backtrace, Context, Error, Fail};

use document::{Document, Environment, Location, Provider, Scope, Value};
use kms::{AwsKms, EncryptionContext, GcpKms, KmsAdapter};
use validate;
use Result;

#[derive(Debug)]
pub struct MutateError {
    inner: Context<MutateErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum MutateErrKind {
    #[fail(display = "{}", _0)]
    ConfigError(String),

    #[fail(
        display = "{} looks like a secret (matches {}) - pass --secret or --no-secret explicitly",
        _0, _1
    )]
    AmbiguousSensitivity(String, String),

    #[fail(display = "refusing mutation: the document would no longer validate:\n{}", _0)]
    WouldInvalidate(String),

    #[fail(display = "could not decrypt {} under the current kms_key: {}", _0, _1)]
    RotationDecryptFailed(String, String),
}

impl Fail for MutateError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for MutateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<MutateErrKind> for MutateError {
    fn from(kind: MutateErrKind) -> MutateError {
        MutateError { inner: Context::new(kind) }
    }
}
impl From<Context<MutateErrKind>> for MutateError {
    fn from(inner: Context<MutateErrKind>) -> MutateError {
        MutateError { inner }
    }
}

/// Keywords in a variable name that mark it as probably holding a secret.
/// `add_binding` refuses to guess silently when one of these appears and the
/// caller didn't say `--secret`/`--no-secret` (`sensitivity: None`).
const SENSITIVE_KEYWORDS: &[&str] = &["PASSWORD", "TOKEN", "SECRET", "KEY"];

fn matched_sensitive_keyword(name: &str) -> Option<&'static str> {
    SENSITIVE_KEYWORDS.iter().find(|kw| name.contains(*kw)).cloned()
}

/// Decide whether `variable` should be stored as a Secret: `explicit` wins
/// when the caller passed `--secret`/`--no-secret`, otherwise a sensitive
/// keyword forces the caller to say so explicitly. Exposed separately from
/// `add_binding` so the CLI can decide *before* encrypting a value — by the
/// time `add_binding` runs, the ciphertext is already in hand.
pub fn resolve_sensitivity(variable: &str, explicit: Option<bool>) -> Result<bool> {
    match explicit {
        Some(s) => Ok(s),
        None => match matched_sensitive_keyword(variable) {
            Some(kw) => Err(Error::from(MutateErrKind::AmbiguousSensitivity(variable.to_string(), kw.to_string()))),
            None => Ok(false),
        },
    }
}

/// Add or replace a binding. `sensitivity` is `Some(true)`/`Some(false)` when
/// the caller passed an explicit `--secret`/`--no-secret`, `None` otherwise.
///
/// Guards, in order: sensitivity-keyword ambiguity, Secret at DEFAULT scope
/// (forbidden — no single (env, loc) to derive an encryption context from),
/// unknown `env`/`loc` (the Open Question in §9 resolves this to rejecting up
/// front rather than deferring to load time), provider/indirection mismatch,
/// mandatory description on a new variable, and finally a post-insertion
/// cycle re-check — the binding is only committed to `doc` if the document
/// still validates afterwards.
pub fn add_binding(
    doc: &mut Document,
    variable: &str,
    scope: Scope,
    raw_value: &str,
    sensitivity: Option<bool>,
    description: Option<&str>,
    validation: Option<&str>,
) -> Result<()> {
    let is_new_variable = !doc.variables.contains_key(variable);
    let is_secret = resolve_sensitivity(variable, sensitivity)?;

    if is_secret && scope == Scope::Default {
        return Err(Error::from(MutateErrKind::ConfigError(
            "a Secret value needs at least one of --env/--loc; DEFAULT scope has no encryption context".to_string(),
        )));
    }

    if let Some(env) = scope.environment() {
        if !doc.has_environment(env) {
            return Err(Error::from(MutateErrKind::ConfigError(format!(
                "no such environment: {}",
                env
            ))));
        }
    }
    if let Some(loc) = scope.location_id() {
        if !doc.locations.contains_key(loc) {
            return Err(Error::from(MutateErrKind::ConfigError(format!(
                "no such location: {}",
                loc
            ))));
        }
    }

    if !is_secret {
        if let Some(provider) = doc.provider() {
            let forbidden = provider.foreign_indirection_prefix();
            if raw_value.starts_with(forbidden) {
                return Err(Error::from(MutateErrKind::ConfigError(format!(
                    "{} is foreign to this document's {:?} provider",
                    forbidden, provider
                ))));
            }
        }
    }

    if is_new_variable && doc.description_mandatory && description.unwrap_or("").trim().is_empty() {
        return Err(Error::from(MutateErrKind::ConfigError(format!(
            "{} requires a description",
            variable
        ))));
    }

    let mut candidate = doc.clone();
    candidate.variables.entry(variable.to_string()).or_insert_with(|| ::document::Variable::new(variable));
    if let Some(var) = candidate.variables.get_mut(variable) {
        if let Some(desc) = description {
            var.description = Some(desc.to_string());
        }
        if let Some(pattern) = validation {
            var.validation = Some(pattern.to_string());
        }
    }
    let value = if is_secret { Value::Secret(raw_value.to_string()) } else { Value::Plain(raw_value.to_string()) };
    candidate.put_binding(::document::ValueBinding::new(variable, scope, value));

    let failure = validate::validate(&candidate, false);
    let cycle_only: Vec<_> = failure.violations.iter().filter(|v| v.0.contains("circular")).collect();
    if !cycle_only.is_empty() {
        let joined = cycle_only.iter().map(|v| v.0.as_str()).collect::<Vec<_>>().join("\n");
        return Err(Error::from(MutateErrKind::WouldInvalidate(joined)));
    }

    *doc = candidate;
    Ok(())
}

/// Build a brand new `Document` from the flags `init` accepts: an app label, a
/// set of environment names, an optional set of `(name, id)` locations, an
/// optional global `kms_key`, and the `description_mandatory` switch. Never
/// fails — every input is already well-formed by construction (the CLI layer
/// is responsible for rejecting malformed `--env`/`--loc` strings before
/// calling this).
pub fn init(
    app: &str,
    envs: &[String],
    locs: &[(String, String)],
    kms_key: Option<&str>,
    description_mandatory: bool,
) -> Document {
    let mut doc = Document::new();
    doc.app = Some(app.to_string());
    doc.description_mandatory = description_mandatory;
    doc.kms_key = kms_key.map(str::to_string);
    for name in envs {
        doc.environments.insert(name.clone(), Environment::new(name.clone()));
    }
    for (name, id) in locs {
        doc.locations.insert(id.clone(), Location::new(name.clone(), id.clone()));
    }
    doc
}

/// Set or clear the document-wide `kms_key`.
pub fn set_kms_key(doc: &mut Document, kms_key: Option<&str>) {
    doc.kms_key = kms_key.map(str::to_string);
}

/// Set the `description_mandatory` switch. Does not retroactively validate —
/// callers that want immediate feedback should run `validate::validate` after.
pub fn set_description_mandatory(doc: &mut Document, mandatory: bool) {
    doc.description_mandatory = mandatory;
}

/// Declare a new environment. A no-op (not an error) if it already exists.
pub fn add_environment(doc: &mut Document, name: &str) {
    doc.environments.entry(name.to_string()).or_insert_with(|| Environment::new(name));
}

/// Remove a declared environment. Rejected if any binding still scopes to it
/// — an environment with live bindings can't be removed out from under them.
pub fn remove_environment(doc: &mut Document, name: &str) -> Result<()> {
    if !doc.has_environment(name) {
        return Err(Error::from(MutateErrKind::ConfigError(format!("no such environment: {}", name))));
    }
    let referenced = doc.bindings.iter().any(|b| b.scope.environment() == Some(name));
    if referenced {
        return Err(Error::from(MutateErrKind::ConfigError(format!(
            "environment {} still has bindings scoped to it",
            name
        ))));
    }
    doc.environments.remove(name);
    Ok(())
}

/// Declare a new location. A no-op (not an error) if the id already exists.
pub fn add_location(doc: &mut Document, name: &str, id: &str) {
    doc.locations.entry(id.to_string()).or_insert_with(|| Location::new(name, id));
}

/// Remove a declared location by name. Rejected if any binding still scopes
/// to it.
pub fn remove_location(doc: &mut Document, name: &str) -> Result<()> {
    let id = doc
        .location_id_by_name(name)
        .ok_or_else(|| Error::from(MutateErrKind::ConfigError(format!("no such location: {}", name))))?
        .to_string();
    let referenced = doc.bindings.iter().any(|b| b.scope.location_id() == Some(id.as_str()));
    if referenced {
        return Err(Error::from(MutateErrKind::ConfigError(format!(
            "location {} still has bindings scoped to it",
            name
        ))));
    }
    doc.locations.remove(&id);
    Ok(())
}

/// Decrypt every secret binding under `doc`'s current `kms_key`, re-encrypt it
/// under `new_kms_key` with the same encryption context, and return the
/// resulting document. Aborts entirely — returning an error with `doc`
/// untouched — the moment any single secret fails to decrypt, rather than
/// producing a document with some bindings rotated and others not.
///
/// A binding scoped to a location that declares its own `kms_key` override is
/// left untouched: this command rotates the document-wide key, and a
/// location locked to a key of its own is a separate rotation domain that
/// `--new-kms-key` was never told to touch.
pub fn rotate_kms_key(doc: &Document, new_kms_key: &str, adapters: &RotationAdapters) -> Result<Document> {
    let old_key = doc
        .kms_key
        .clone()
        .ok_or_else(|| Error::from(MutateErrKind::ConfigError("document has no kms_key to rotate".to_string())))?;

    let mut rotated = doc.clone();
    rotated.kms_key = Some(new_kms_key.to_string());
    rotated.bindings.clear();

    for binding in &doc.bindings {
        let new_value = match &binding.value {
            Value::Plain(_) => binding.value.clone(),
            Value::Secret(ciphertext) => {
                if doc.kms_key_for_scope(&binding.scope) != Some(old_key.as_str()) {
                    binding.value.clone()
                } else {
                    let ctx = EncryptionContext {
                        app: doc.app.clone().unwrap_or_default(),
                        env: binding.scope.environment().map(str::to_string),
                        location: binding
                            .scope
                            .location_id()
                            .map(|id| doc.locations.get(id).map(|l| l.name.clone()).unwrap_or_else(|| id.to_string())),
                    };
                    let source_adapter = kms_adapter_for(&old_key, adapters);
                    let plaintext = source_adapter.decrypt(ciphertext, &old_key, &ctx).map_err(|e| {
                        Error::from(MutateErrKind::RotationDecryptFailed(binding.variable.clone(), e.to_string()))
                    })?;
                    let dest_adapter = kms_adapter_for(new_kms_key, adapters);
                    let reencrypted = dest_adapter.encrypt(&plaintext, new_kms_key, &ctx).map_err(|e| {
                        Error::from(MutateErrKind::RotationDecryptFailed(binding.variable.clone(), e.to_string()))
                    })?;
                    Value::Secret(reencrypted)
                }
            }
        };
        rotated.put_binding(::document::ValueBinding::new(binding.variable.clone(), binding.scope.clone(), new_value));
    }

    Ok(rotated)
}

/// The pair of KMS adapters `rotate_kms_key` picks between, keyed by each
/// key's provider prefix — rotation can cross providers (an AWS-keyed
/// document moving to a GCP key) so both must be available at once.
pub struct RotationAdapters {
    pub aws: AwsKms,
    pub gcp: GcpKms,
}

impl RotationAdapters {
    pub fn live() -> RotationAdapters {
        RotationAdapters { aws: AwsKms::live(), gcp: GcpKms::live() }
    }

    pub fn mocked() -> RotationAdapters {
        RotationAdapters { aws: AwsKms::mocked(), gcp: GcpKms::mocked() }
    }
}

fn kms_adapter_for<'a>(key: &str, adapters: &'a RotationAdapters) -> &'a KmsAdapter {
    match Provider::from_kms_key(key) {
        Some(Provider::Gcp) => &adapters.gcp,
        _ => &adapters.aws,
    }
}
