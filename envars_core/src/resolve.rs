//! Turn a `Document` plus an `(environment, location)` context into a flat
//! mapping from variable name to its final string value (§4.4).
//!
//! Resolution runs in four steps: pick the most specific binding for each
//! variable (Step A, `Document::get_binding`), decrypt any secret (Step B,
//! `kms`), expand `{{ NAME }}` / `{{ env.get(...) }}` templates in dependency
//! order (Step C, `template`), then dereference any indirection prefix left
//! standing (Step D, `indirection`).

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use failure::{Backtrace, Context, Error, Fail};

use document::{Document, Scope, Value};
use indirection::{Adapters as IndirectionAdapters, IndirectRef};
use kms::{AwsKms, EncryptionContext, GcpKms, KmsAdapter};
use template;
use Result;

#[derive(Debug)]
pub struct ResolveError {
    inner: Context<ResolveErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ResolveErrKind {
    #[fail(display = "no environment given: pass --env or set ENVARS_ENV")]
    MissingEnv,

    #[fail(display = "{}", _0)]
    ConfigError(String),

    #[fail(display = "{} references undefined variable {}", _0, _1)]
    TemplateError(String, String),

    #[fail(display = "circular reference among: {}", _0)]
    CycleDetected(String),

    #[fail(display = "could not resolve {}: {}", _0, _1)]
    ResolutionError(String, String),
}

impl Fail for ResolveError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<ResolveErrKind> for ResolveError {
    fn from(kind: ResolveErrKind) -> ResolveError {
        ResolveError { inner: Context::new(kind) }
    }
}
impl From<Context<ResolveErrKind>> for ResolveError {
    fn from(inner: Context<ResolveErrKind>) -> ResolveError {
        ResolveError { inner }
    }
}

/// The live or mocked adapter set the resolution engine threads through Steps
/// B and D. Bundled together since both are keyed off the same `kms_key`'s
/// provider (an AWS key never talks to GCP Secret Manager and vice versa).
pub struct Adapters {
    pub aws_kms: AwsKms,
    pub gcp_kms: GcpKms,
    pub indirection: IndirectionAdapters,
}

impl Adapters {
    pub fn live() -> Adapters {
        Adapters { aws_kms: AwsKms::live(), gcp_kms: GcpKms::live(), indirection: IndirectionAdapters::live() }
    }

    pub fn mocked() -> Adapters {
        Adapters { aws_kms: AwsKms::mocked(), gcp_kms: GcpKms::mocked(), indirection: IndirectionAdapters::mocked() }
    }

    fn kms_for(&self, key: &str) -> &KmsAdapter {
        if key.starts_with("projects/") {
            &self.gcp_kms
        } else {
            &self.aws_kms
        }
    }
}

/// Resolve every variable in `doc` for `(env, loc)`, talking to live cloud
/// services. `loc` is a location name (as it appears in the document surface
/// and on the CLI); it is translated to the internal location id here.
pub fn resolve(doc: &Document, env: Option<&str>, loc: Option<&str>, decrypt: bool) -> Result<BTreeMap<String, String>> {
    resolve_with_adapters(doc, env, loc, decrypt, &Adapters::live())
}

pub fn resolve_with_adapters(
    doc: &Document,
    env: Option<&str>,
    loc: Option<&str>,
    decrypt: bool,
    adapters: &Adapters,
) -> Result<BTreeMap<String, String>> {
    if env.is_none() {
        return Err(Error::from(ResolveErrKind::MissingEnv));
    }
    let loc_id = match loc {
        Some(name) => Some(
            doc.location_id_by_name(name)
                .ok_or_else(|| Error::from(ResolveErrKind::ConfigError(format!("no such location: {}", name))))?
                .to_string(),
        ),
        None => None,
    };

    // Step A: pick a binding per variable.
    let mut raw: BTreeMap<String, (Value, Scope)> = BTreeMap::new();
    for name in doc.variables.keys() {
        if let Some(binding) = doc.get_binding(name, env, loc_id.as_deref()) {
            raw.insert(name.clone(), (binding.value.clone(), binding.scope.clone()));
        }
    }

    // Step B: unwrap secrets. The key is the binding's own scope's effective
    // key (a location override if its scope carries one, else the
    // document-wide `kms_key`) so a binding scoped to a location with its own
    // key never gets decrypted against the wrong key.
    let mut plain: BTreeMap<String, String> = BTreeMap::new();
    for (name, (value, scope)) in &raw {
        match value {
            Value::Plain(s) => {
                plain.insert(name.clone(), s.clone());
            }
            Value::Secret(ciphertext) => {
                if !decrypt {
                    plain.insert(name.clone(), ciphertext.clone());
                    continue;
                }
                let key = doc.kms_key_for_scope(scope).ok_or_else(|| {
                    Error::from(ResolveErrKind::ConfigError(format!(
                        "{} is a secret but no kms_key is configured",
                        name
                    )))
                })?;
                let ctx = EncryptionContext {
                    app: doc.app.clone().unwrap_or_default(),
                    env: scope.environment().map(str::to_string),
                    location: scope
                        .location_id()
                        .map(|id| doc.locations.get(id).map(|l| l.name.clone()).unwrap_or_else(|| id.to_string())),
                };
                let adapter = adapters.kms_for(key);
                let value = adapter
                    .decrypt(ciphertext, key, &ctx)
                    .map_err(|e| Error::from(ResolveErrKind::ResolutionError(name.clone(), e.to_string())))?;
                plain.insert(name.clone(), value);
            }
        }
    }

    // Step C: expand templates in dependency order.
    let process_env: BTreeMap<String, String> = ::std::env::vars().collect();
    let names: Vec<String> = plain.keys().cloned().collect();
    let edges: Vec<(String, String)> = plain
        .iter()
        .flat_map(|(name, value)| {
            template::referenced_names(value).into_iter().map(move |dep| (dep, name.clone()))
        })
        .collect();
    let order = template::topo_order(&names, &edges).map_err(|cycle| {
        Error::from(ResolveErrKind::CycleDetected(cycle.0.join(", ")))
    })?;

    for name in order {
        let template_str = plain.get(&name).cloned().unwrap_or_default();
        let with_env = template::render_env_refs(&template_str, &process_env);
        for dep in template::referenced_names(&with_env) {
            if !plain.contains_key(&dep) {
                return Err(Error::from(ResolveErrKind::TemplateError(name.clone(), dep)));
            }
        }
        let mut ctx = ::tera::Context::new();
        for (k, v) in &plain {
            ctx.insert(k, v);
        }
        let rendered = ::tera::Tera::one_off(&with_env, &ctx, false)
            .map_err(|e| Error::from(ResolveErrKind::TemplateError(name.clone(), e.to_string())))?;
        plain.insert(name, rendered);
    }

    // Step D: dereference indirection.
    let mut resolved = BTreeMap::new();
    for (name, value) in plain {
        let final_value = match IndirectRef::parse(&value) {
            Some(indirect) => adapters
                .indirection
                .resolve(&indirect)
                .map_err(|e| Error::from(ResolveErrKind::ResolutionError(name.clone(), e.to_string())))?,
            None => value,
        };
        resolved.insert(name, final_value);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use document::{Document, Environment, Location, Scope, Value, ValueBinding, Variable};

    fn base_doc() -> Document {
        let mut d = Document::new();
        d.app = Some("demo".to_string());
        d.environments.insert("dev".into(), Environment::new("dev"));
        d.locations.insert("111".into(), Location::new("aws", "111"));
        d
    }

    #[test]
    fn missing_env_fails() {
        let d = base_doc();
        let err = resolve_with_adapters(&d, None, Some("aws"), true, &Adapters::mocked()).unwrap_err();
        assert!(format!("{}", err).contains("--env"));
    }

    #[test]
    fn precedence_and_plain_values() {
        let mut d = base_doc();
        d.variables.insert("HOST".into(), Variable::new("HOST"));
        d.put_binding(ValueBinding::new("HOST", Scope::Default, Value::Plain("example.com".into())));
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &Adapters::mocked()).unwrap();
        assert_eq!(resolved.get("HOST").unwrap(), "example.com");
    }

    #[test]
    fn template_chain_expands_in_order() {
        let mut d = base_doc();
        d.variables.insert("DOMAIN".into(), Variable::new("DOMAIN"));
        d.variables.insert("HOSTNAME".into(), Variable::new("HOSTNAME"));
        d.variables.insert("URL".into(), Variable::new("URL"));
        d.put_binding(ValueBinding::new("DOMAIN", Scope::Default, Value::Plain("example.com".into())));
        d.put_binding(ValueBinding::new("HOSTNAME", Scope::Default, Value::Plain("api.{{ DOMAIN }}".into())));
        d.put_binding(ValueBinding::new("URL", Scope::Default, Value::Plain("https://{{ HOSTNAME }}".into())));
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &Adapters::mocked()).unwrap();
        assert_eq!(resolved.get("URL").unwrap(), "https://api.example.com");
    }

    #[test]
    fn cycle_is_rejected() {
        let mut d = base_doc();
        d.variables.insert("A".into(), Variable::new("A"));
        d.variables.insert("B".into(), Variable::new("B"));
        d.put_binding(ValueBinding::new("A", Scope::Default, Value::Plain("{{ B }}".into())));
        d.put_binding(ValueBinding::new("B", Scope::Default, Value::Plain("{{ A }}".into())));
        let err = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &Adapters::mocked()).unwrap_err();
        assert!(format!("{}", err).contains("circular"));
    }

    #[test]
    fn undefined_template_reference_fails() {
        let mut d = base_doc();
        d.variables.insert("URL".into(), Variable::new("URL"));
        d.put_binding(ValueBinding::new("URL", Scope::Default, Value::Plain("https://{{ MISSING }}".into())));
        let err = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &Adapters::mocked()).unwrap_err();
        assert!(format!("{}", err).contains("MISSING"));
    }

    #[test]
    fn secret_without_kms_key_fails() {
        let mut d = base_doc();
        d.variables.insert("PASSWORD".into(), Variable::new("PASSWORD"));
        d.put_binding(ValueBinding::new("PASSWORD", Scope::Default, Value::Secret("ciphertext".into())));
        let err = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &Adapters::mocked()).unwrap_err();
        assert!(format!("{}", err).contains("kms_key"));
    }

    #[test]
    fn secret_round_trips_through_kms() {
        let mut d = base_doc();
        d.kms_key = Some("arn:aws:kms:us-east-1:1:key/demo".to_string());
        d.variables.insert("PASSWORD".into(), Variable::new("PASSWORD"));
        let adapters = Adapters::mocked();
        let ctx = EncryptionContext { app: "demo".to_string(), env: Some("dev".to_string()), location: Some("aws".to_string()) };
        let ciphertext = adapters.aws_kms.encrypt("hunter2", d.kms_key.as_ref().unwrap(), &ctx).unwrap();
        d.put_binding(ValueBinding::new(
            "PASSWORD",
            Scope::Specific("dev".into(), "111".into()),
            Value::Secret(ciphertext),
        ));
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &adapters).unwrap();
        assert_eq!(resolved.get("PASSWORD").unwrap(), "hunter2");
    }

    #[test]
    fn secret_context_is_derived_from_its_own_scope_not_the_resolve_call() {
        // Encrypted at ENVIRONMENT(dev) scope, i.e. with no location in its
        // context. Resolving with a location given must still decrypt
        // correctly: the context comes from the binding's own scope, not from
        // whatever (env, loc) the caller resolved against.
        let mut d = base_doc();
        d.kms_key = Some("arn:aws:kms:us-east-1:1:key/demo".to_string());
        d.variables.insert("PASSWORD".into(), Variable::new("PASSWORD"));
        let adapters = Adapters::mocked();
        let ctx = EncryptionContext { app: "demo".to_string(), env: Some("dev".to_string()), location: None };
        let ciphertext = adapters.aws_kms.encrypt("hunter2", d.kms_key.as_ref().unwrap(), &ctx).unwrap();
        d.put_binding(ValueBinding::new("PASSWORD", Scope::Environment("dev".into()), Value::Secret(ciphertext)));
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &adapters).unwrap();
        assert_eq!(resolved.get("PASSWORD").unwrap(), "hunter2");
    }

    #[test]
    fn location_kms_key_override_is_used_for_decrypt() {
        let mut d = base_doc();
        d.kms_key = Some("arn:aws:kms:us-east-1:1:key/global".to_string());
        d.locations.get_mut("111").unwrap().kms_key = Some("arn:aws:kms:us-east-1:1:key/aws-only".to_string());
        d.variables.insert("PASSWORD".into(), Variable::new("PASSWORD"));
        let adapters = Adapters::mocked();
        let ctx = EncryptionContext { app: "demo".to_string(), env: None, location: Some("aws".to_string()) };
        let ciphertext = adapters
            .aws_kms
            .encrypt("hunter2", "arn:aws:kms:us-east-1:1:key/aws-only", &ctx)
            .unwrap();
        d.put_binding(ValueBinding::new("PASSWORD", Scope::Location("111".into()), Value::Secret(ciphertext)));
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &adapters).unwrap();
        assert_eq!(resolved.get("PASSWORD").unwrap(), "hunter2");
    }

    #[test]
    fn indirection_is_dereferenced() {
        let mut d = base_doc();
        d.variables.insert("DB_PASSWORD".into(), Variable::new("DB_PASSWORD"));
        d.put_binding(ValueBinding::new(
            "DB_PASSWORD",
            Scope::Default,
            Value::Plain("parameter_store:/demo/db/password".into()),
        ));
        let adapters = Adapters {
            aws_kms: AwsKms::mocked(),
            gcp_kms: GcpKms::mocked(),
            indirection: IndirectionAdapters::mocked().with_mocked_parameter("/demo/db/password", "s3cr3t"),
        };
        let resolved = resolve_with_adapters(&d, Some("dev"), Some("aws"), true, &adapters).unwrap();
        assert_eq!(resolved.get("DB_PASSWORD").unwrap(), "s3cr3t");
    }
}
