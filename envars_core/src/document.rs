use std::collections::BTreeMap;

/// A value bound at some scope.
///
/// A `Secret` is opaque ciphertext; it is never used for template expansion or
/// indirection dereference until the resolution engine decrypts it (see
/// `envars_core::resolve`).
///
/// ```yaml
/// API_KEY:
///   prod: !secret |
///     AQICAHjK...==
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Plain(String),
    Secret(String),
}

impl Value {
    /// The raw string carried by this value, ciphertext or not.
    pub fn raw(&self) -> &str {
        match self {
            Value::Plain(s) => s,
            Value::Secret(s) => s,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Value::Secret(_))
    }

    pub fn map_raw<F: FnOnce(String) -> String>(self, f: F) -> Value {
        match self {
            Value::Plain(s) => Value::Plain(f(s)),
            Value::Secret(s) => Value::Secret(f(s)),
        }
    }
}

/// The four precedence levels a `ValueBinding` can occupy.
///
/// Carries only the fields each variant needs (Design Note "Scope as sum type"),
/// collapsing what would otherwise be runtime guards on `(environment, location)`
/// into construction-time totality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Default,
    /// Environment name.
    Environment(String),
    /// Location id (not name — the id is the stable key).
    Location(String),
    /// (environment name, location id).
    Specific(String, String),
}

impl Scope {
    pub fn environment(&self) -> Option<&str> {
        match self {
            Scope::Environment(e) | Scope::Specific(e, _) => Some(e),
            _ => None,
        }
    }

    pub fn location_id(&self) -> Option<&str> {
        match self {
            Scope::Location(l) | Scope::Specific(_, l) => Some(l),
            _ => None,
        }
    }
}

/// Deployment or operational environment. No state beyond identity and an
/// optional description (the document file format never serializes the
/// description; it exists for API symmetry with `Variable`/`Location`).
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub name: String,
    pub description: Option<String>,
}

impl Environment {
    pub fn new<S: Into<String>>(name: S) -> Environment {
        Environment { name: name.into(), description: None }
    }
}

/// A place variables are deployed to: an AWS account or GCP project.
///
/// `id` is the stable cloud account/project id used by the identity probe and
/// as the resolver's internal key; `name` is the human label used in the
/// document surface and on the CLI.
#[derive(Debug, Clone)]
pub struct Location {
    pub name: String,
    pub id: String,
    pub kms_key: Option<String>,
}

impl Location {
    pub fn new<N: Into<String>, I: Into<String>>(name: N, id: I) -> Location {
        Location { name: name.into(), id: id.into(), kms_key: None }
    }
}

/// A configuration variable, identified by its uppercase name.
#[derive(Debug, Clone, Default)]
pub struct Variable {
    pub name: String,
    pub description: Option<String>,
    /// Source text of a regular expression every binding's raw value must match.
    pub validation: Option<String>,
}

impl Variable {
    pub fn new<S: Into<String>>(name: S) -> Variable {
        Variable { name: name.into(), description: None, validation: None }
    }
}

/// Returns true iff `name` is a valid variable name: equal to its own uppercase
/// form. The canonical alphabet is `[A-Z][A-Z0-9_]*`; this is the cheaper
/// equivalent check the loader and the `add` mutation both rely on.
pub fn is_valid_variable_name(name: &str) -> bool {
    !name.is_empty() && name == name.to_uppercase()
}

/// One (variable, scope, value) record. The `(variable, scope, environment,
/// location)` tuple is unique across a document's bindings — `Document::put_binding`
/// enforces this by replacing any existing binding at the same scope.
#[derive(Debug, Clone)]
pub struct ValueBinding {
    pub variable: String,
    pub scope: Scope,
    pub value: Value,
}

impl ValueBinding {
    pub fn new<S: Into<String>>(variable: S, scope: Scope, value: Value) -> ValueBinding {
        ValueBinding { variable: variable.into(), scope, value }
    }
}

/// Root of the configuration document.
///
/// A `Document` owns no network clients and performs no I/O; it is a plain
/// value loaded by `envars_core::codec`, inspected by `envars_core::validate`,
/// edited by `envars_core::mutate`, and consumed by `envars_core::resolve`.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub app: Option<String>,
    pub kms_key: Option<String>,
    pub description_mandatory: bool,
    pub environments: BTreeMap<String, Environment>,
    /// Keyed by location id, per the spec's data model.
    pub locations: BTreeMap<String, Location>,
    pub variables: BTreeMap<String, Variable>,
    pub bindings: Vec<ValueBinding>,
}

/// The cloud provider implied by a KMS key's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Gcp,
}

impl Provider {
    /// `arn:aws:kms:` implies AWS, `projects:` implies GCP, anything else (or
    /// no key at all) implies no constraint.
    pub fn from_kms_key(key: &str) -> Option<Provider> {
        if key.starts_with("arn:aws:kms:") {
            Some(Provider::Aws)
        } else if key.starts_with("projects/") {
            Some(Provider::Gcp)
        } else {
            None
        }
    }

    /// The indirection prefix that belongs to the *other* provider, i.e. the one
    /// forbidden by invariant 4.
    pub fn foreign_indirection_prefix(self) -> &'static str {
        match self {
            Provider::Aws => "gcp_secret_manager:",
            Provider::Gcp => "parameter_store:",
        }
    }
}

impl Document {
    pub fn new() -> Document {
        Document::default()
    }

    pub fn provider(&self) -> Option<Provider> {
        self.kms_key.as_deref().and_then(Provider::from_kms_key)
    }

    /// The KMS key that encrypts/decrypts a binding at `scope`: a location's
    /// own override when the scope carries a location id and that location
    /// declares one, else the document-wide `kms_key`.
    pub fn kms_key_for_scope(&self, scope: &Scope) -> Option<&str> {
        if let Some(loc_id) = scope.location_id() {
            if let Some(key) = self.locations.get(loc_id).and_then(|l| l.kms_key.as_deref()) {
                return Some(key);
            }
        }
        self.kms_key.as_deref()
    }

    pub fn has_environment(&self, name: &str) -> bool {
        self.environments.contains_key(name)
    }

    pub fn location_by_name(&self, name: &str) -> Option<&Location> {
        self.locations.values().find(|l| l.name == name)
    }

    pub fn location_id_by_name(&self, name: &str) -> Option<&str> {
        self.location_by_name(name).map(|l| l.id.as_str())
    }

    pub fn has_location_name(&self, name: &str) -> bool {
        self.location_by_name(name).is_some()
    }

    /// Insert or replace a binding at the same `(variable, scope)` key.
    pub fn put_binding(&mut self, binding: ValueBinding) {
        self.bindings.retain(|b| !(b.variable == binding.variable && b.scope == binding.scope));
        self.bindings.push(binding);
    }

    pub fn bindings_for(&self, variable: &str) -> impl Iterator<Item = &ValueBinding> {
        self.bindings.iter().filter(move |b| b.variable == variable)
    }

    /// Select the most specific binding for `variable` in context `(env, loc)`,
    /// per §4.4 Step A: SPECIFIC(e,l) -> ENVIRONMENT(e) -> LOCATION(l) -> DEFAULT.
    /// `loc` is a location *id* here (callers resolve name -> id first).
    pub fn get_binding(&self, variable: &str, env: Option<&str>, loc: Option<&str>) -> Option<&ValueBinding> {
        let candidates: Vec<&ValueBinding> = self.bindings_for(variable).collect();

        if let (Some(e), Some(l)) = (env, loc) {
            if let Some(b) = candidates.iter().find(|b| b.scope == Scope::Specific(e.to_string(), l.to_string())) {
                return Some(b);
            }
        }
        if let Some(e) = env {
            if let Some(b) = candidates.iter().find(|b| b.scope == Scope::Environment(e.to_string())) {
                return Some(b);
            }
        }
        if let Some(l) = loc {
            if let Some(b) = candidates.iter().find(|b| b.scope == Scope::Location(l.to_string())) {
                return Some(b);
            }
        }
        candidates.into_iter().find(|b| b.scope == Scope::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_precedence() -> Document {
        let mut d = Document::new();
        d.environments.insert("dev".into(), Environment::new("dev"));
        d.environments.insert("prod".into(), Environment::new("prod"));
        d.locations.insert("111".into(), Location::new("aws", "111"));
        d.locations.insert("222".into(), Location::new("gcp", "222"));
        d.variables.insert("API_KEY".into(), Variable::new("API_KEY"));
        d.put_binding(ValueBinding::new("API_KEY", Scope::Default, Value::Plain("d".into())));
        d.put_binding(ValueBinding::new("API_KEY", Scope::Environment("dev".into()), Value::Plain("de".into())));
        d.put_binding(ValueBinding::new("API_KEY", Scope::Location("111".into()), Value::Plain("al".into())));
        d.put_binding(ValueBinding::new(
            "API_KEY",
            Scope::Specific("dev".into(), "111".into()),
            Value::Plain("sp".into()),
        ));
        d
    }

    #[test]
    fn precedence_chain() {
        let d = doc_with_precedence();
        assert_eq!(d.get_binding("API_KEY", Some("dev"), Some("111")).unwrap().value.raw(), "sp");
        assert_eq!(d.get_binding("API_KEY", Some("dev"), Some("222")).unwrap().value.raw(), "de");
        assert_eq!(d.get_binding("API_KEY", Some("prod"), Some("111")).unwrap().value.raw(), "al");
        assert_eq!(d.get_binding("API_KEY", Some("prod"), Some("222")).unwrap().value.raw(), "d");
    }

    #[test]
    fn put_binding_replaces_same_scope() {
        let mut d = Document::new();
        d.put_binding(ValueBinding::new("X", Scope::Default, Value::Plain("one".into())));
        d.put_binding(ValueBinding::new("X", Scope::Default, Value::Plain("two".into())));
        assert_eq!(d.bindings.len(), 1);
        assert_eq!(d.bindings[0].value.raw(), "two");
    }

    #[test]
    fn variable_name_case() {
        assert!(is_valid_variable_name("API_KEY"));
        assert!(is_valid_variable_name("X"));
        assert!(!is_valid_variable_name("api_key"));
        assert!(!is_valid_variable_name(""));
    }

    #[test]
    fn kms_key_for_scope_prefers_location_override() {
        let mut d = Document::new();
        d.kms_key = Some("arn:aws:kms:us-east-1:1:key/global".into());
        let mut loc = Location::new("aws", "111");
        loc.kms_key = Some("arn:aws:kms:us-east-1:1:key/aws-only".into());
        d.locations.insert("111".into(), loc);
        d.locations.insert("222".into(), Location::new("gcp", "222"));

        assert_eq!(d.kms_key_for_scope(&Scope::Location("111".into())), Some("arn:aws:kms:us-east-1:1:key/aws-only"));
        assert_eq!(d.kms_key_for_scope(&Scope::Specific("dev".into(), "111".into())), Some("arn:aws:kms:us-east-1:1:key/aws-only"));
        assert_eq!(d.kms_key_for_scope(&Scope::Location("222".into())), Some("arn:aws:kms:us-east-1:1:key/global"));
        assert_eq!(d.kms_key_for_scope(&Scope::Default), Some("arn:aws:kms:us-east-1:1:key/global"));
    }

    #[test]
    fn provider_from_kms_key() {
        assert_eq!(Provider::from_kms_key("arn:aws:kms:us-east-1:1:key/x"), Some(Provider::Aws));
        assert_eq!(Provider::from_kms_key("projects/p/locations/l/keyRings/r/cryptoKeys/k"), Some(Provider::Gcp));
        assert_eq!(Provider::from_kms_key("whatever"), None);
    }
}
