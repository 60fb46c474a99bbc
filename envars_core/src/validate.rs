//! Check every static invariant of a `Document` without attempting to reach
//! any network (§4.5). Unlike `resolve`, `validate` never short-circuits on
//! the first problem: every violation is collected, deduplicated, and
//! returned together so a single run surfaces the whole picture.

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use failure::{Backtrace, Fail};
use regex::Regex;

use document::{Document, Provider, Scope, Value};
use template;

/// One broken invariant, rendered the way it will be shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Violation(pub String);

/// The aggregate result of `validate`: a deduplicated, sorted set of every
/// invariant violation found. Not a `#[derive(Fail)]` struct since its display
/// needs to iterate `violations`, which the derive macro's literal
/// `#[fail(display = "...")]` strings can't express.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationFailure {
    pub violations: BTreeSet<Violation>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }
}

impl Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", v.0)?;
        }
        Ok(())
    }
}

impl Fail for ValidationFailure {
    fn cause(&self) -> Option<&Fail> {
        None
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        None
    }
}

/// Check `doc` against every invariant in §4.5. When `ignore_default_secrets`
/// is set, invariant 6 (every secret must have a dedicated `kms_key`) is not
/// applied to bindings at `Scope::Default`, matching the document-level
/// `description_mandatory`-style opt-out the mutation layer also honors.
pub fn validate(doc: &Document, ignore_default_secrets: bool) -> ValidationFailure {
    let mut violations = BTreeSet::new();

    // 1. Every variable name is canonical uppercase.
    for name in doc.variables.keys() {
        if name != &name.to_uppercase() {
            violations.insert(Violation(format!("variable name {} is not uppercase", name)));
        }
    }

    // 2. Every binding references a declared variable.
    for binding in &doc.bindings {
        if !doc.variables.contains_key(&binding.variable) {
            violations.insert(Violation(format!(
                "binding for {} has no matching variable declaration",
                binding.variable
            )));
        }
    }

    // 3. Every binding's scope references a declared environment/location.
    for binding in &doc.bindings {
        if let Some(env) = binding.scope.environment() {
            if !doc.has_environment(env) {
                violations.insert(Violation(format!(
                    "binding for {} references undeclared environment {}",
                    binding.variable, env
                )));
            }
        }
        if let Some(loc) = binding.scope.location_id() {
            if !doc.locations.contains_key(loc) {
                violations.insert(Violation(format!(
                    "binding for {} references undeclared location {}",
                    binding.variable, loc
                )));
            }
        }
    }

    // 4. No indirection reference crosses providers (an AWS-keyed document
    //    can't point a binding at GCP Secret Manager and vice versa).
    if let Some(provider) = doc.provider() {
        let forbidden = provider.foreign_indirection_prefix();
        for binding in &doc.bindings {
            if let Value::Plain(raw) = &binding.value {
                if raw.starts_with(forbidden) {
                    violations.insert(Violation(format!(
                        "binding for {} uses {} which is foreign to the document's {:?} provider",
                        binding.variable, forbidden, provider
                    )));
                }
            }
        }
    }

    // 5. A description is present for every variable when mandated.
    if doc.description_mandatory {
        for (name, var) in &doc.variables {
            if var.description.as_deref().unwrap_or("").trim().is_empty() {
                violations.insert(Violation(format!("variable {} has no description", name)));
            }
        }
    }

    // 4 (cross-entity, §3). No DEFAULT-scoped Secret: a value meant to apply
    // everywhere has no single (env, loc) to derive an encryption context
    // from. `--ignore-default-secrets` exists for documents mid-migration
    // that already carry one and aren't ready to fix it yet.
    if !ignore_default_secrets {
        for binding in &doc.bindings {
            if binding.scope == Scope::Default && binding.value.is_secret() {
                violations.insert(Violation(format!(
                    "binding for {} is a Secret at DEFAULT scope, which has no encryption context",
                    binding.variable
                )));
            }
        }
    }

    // Every secret binding has a resolvable kms_key (a document-level
    // precondition `resolve`'s Step B also enforces, surfaced here too so
    // `validate` catches it without a resolution pass).
    for binding in &doc.bindings {
        if binding.value.is_secret() && doc.kms_key.is_none() {
            violations.insert(Violation(format!(
                "binding for {} is a secret but the document has no kms_key",
                binding.variable
            )));
        }
    }

    // 7. Every binding's raw value matches its variable's validation pattern.
    for binding in &doc.bindings {
        if let Some(var) = doc.variables.get(&binding.variable) {
            if let Some(pattern) = &var.validation {
                match Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(binding.value.raw()) {
                            violations.insert(Violation(format!(
                                "binding for {} does not match its validation pattern {}",
                                binding.variable, pattern
                            )));
                        }
                    }
                    Err(_) => {
                        violations.insert(Violation(format!(
                            "variable {} has an invalid validation pattern {}",
                            binding.variable, pattern
                        )));
                    }
                }
            }
        }
    }

    // 6. No circular template reference, in any (environment, location)
    //    context the document declares, plus the context-free check (a cycle
    //    that exists regardless of which binding precedence wins can't be
    //    caught by iterating concrete contexts alone when a document declares
    //    no environments or locations at all).
    let mut contexts: Vec<(Option<&str>, Option<&str>)> = vec![(None, None)];
    for env in doc.environments.keys() {
        contexts.push((Some(env.as_str()), None));
    }
    for loc in doc.locations.keys() {
        contexts.push((None, Some(loc.as_str())));
    }
    for env in doc.environments.keys() {
        for loc in doc.locations.keys() {
            contexts.push((Some(env.as_str()), Some(loc.as_str())));
        }
    }

    for (env, loc) in contexts {
        let mut values: Vec<(String, String)> = Vec::new();
        for name in doc.variables.keys() {
            if let Some(binding) = doc.get_binding(name, env, loc) {
                values.push((name.clone(), binding.value.raw().to_string()));
            }
        }
        let names: Vec<String> = values.iter().map(|(n, _)| n.clone()).collect();
        let edges: Vec<(String, String)> = values
            .iter()
            .flat_map(|(name, raw)| {
                template::referenced_names(raw).into_iter().map(move |dep| (dep, name.clone()))
            })
            .collect();
        if let Err(cycle) = template::topo_order(&names, &edges) {
            let context = match (env, loc) {
                (None, None) => "the default context".to_string(),
                (Some(e), None) => format!("environment {}", e),
                (None, Some(l)) => {
                    format!("location {}", doc.locations.get(l).map(|location| location.name.as_str()).unwrap_or(l))
                }
                (Some(e), Some(l)) => format!(
                    "environment {}, location {}",
                    e,
                    doc.locations.get(l).map(|location| location.name.as_str()).unwrap_or(l)
                ),
            };
            violations.insert(Violation(format!(
                "circular reference among: {} in {}",
                cycle.0.join(", "),
                context
            )));
        }
    }

    ValidationFailure { violations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use document::{Document, Environment, Location, Scope, Value, ValueBinding, Variable};

    #[test]
    fn empty_document_is_valid() {
        let d = Document::new();
        assert!(validate(&d, false).is_empty());
    }

    #[test]
    fn rejects_default_scoped_secret() {
        let mut d = Document::new();
        d.kms_key = Some("arn:aws:kms:us-east-1:1:key/demo".into());
        d.variables.insert("PASSWORD".into(), Variable::new("PASSWORD"));
        d.put_binding(ValueBinding::new("PASSWORD", Scope::Default, Value::Secret("ct".into())));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("DEFAULT scope")));
        let ignored = validate(&d, true);
        assert!(!ignored.violations.iter().any(|v| v.0.contains("DEFAULT scope")));
    }

    #[test]
    fn rejects_value_not_matching_validation_pattern() {
        let mut d = Document::new();
        let mut var = Variable::new("PORT");
        var.validation = Some(r"^\d+$".to_string());
        d.variables.insert("PORT".into(), var);
        d.put_binding(ValueBinding::new("PORT", Scope::Default, Value::Plain("not-a-number".into())));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("validation pattern")));
    }

    #[test]
    fn rejects_binding_without_variable() {
        let mut d = Document::new();
        d.put_binding(ValueBinding::new("GHOST", Scope::Default, Value::Plain("x".into())));
        let failure = validate(&d, false);
        assert!(!failure.is_empty());
        assert!(failure.violations.iter().any(|v| v.0.contains("GHOST")));
    }

    #[test]
    fn rejects_binding_with_undeclared_environment() {
        let mut d = Document::new();
        d.variables.insert("X".into(), Variable::new("X"));
        d.put_binding(ValueBinding::new("X", Scope::Environment("prod".into()), Value::Plain("x".into())));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("prod")));
    }

    #[test]
    fn requires_description_when_mandatory() {
        let mut d = Document::new();
        d.description_mandatory = true;
        d.variables.insert("X".into(), Variable::new("X"));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("description")));
    }

    #[test]
    fn requires_kms_key_for_secrets() {
        let mut d = Document::new();
        d.variables.insert("X".into(), Variable::new("X"));
        d.put_binding(ValueBinding::new("X", Scope::Default, Value::Secret("ct".into())));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("kms_key")));
    }

    #[test]
    fn detects_cycle_in_default_context() {
        let mut d = Document::new();
        d.variables.insert("A".into(), Variable::new("A"));
        d.variables.insert("B".into(), Variable::new("B"));
        d.put_binding(ValueBinding::new("A", Scope::Default, Value::Plain("{{ B }}".into())));
        d.put_binding(ValueBinding::new("B", Scope::Default, Value::Plain("{{ A }}".into())));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("circular")));
    }

    #[test]
    fn detects_cycle_only_in_specific_context() {
        let mut d = Document::new();
        d.environments.insert("prod".into(), Environment::new("prod"));
        d.locations.insert("111".into(), Location::new("aws", "111"));
        d.variables.insert("A".into(), Variable::new("A"));
        d.variables.insert("B".into(), Variable::new("B"));
        d.put_binding(ValueBinding::new("A", Scope::Default, Value::Plain("plain".into())));
        d.put_binding(ValueBinding::new("B", Scope::Default, Value::Plain("plain".into())));
        d.put_binding(ValueBinding::new(
            "A",
            Scope::Specific("prod".into(), "111".into()),
            Value::Plain("{{ B }}".into()),
        ));
        d.put_binding(ValueBinding::new(
            "B",
            Scope::Specific("prod".into(), "111".into()),
            Value::Plain("{{ A }}".into()),
        ));
        let failure = validate(&d, false);
        assert!(failure.violations.iter().any(|v| v.0.contains("circular")));
    }

    #[test]
    fn violations_are_deduplicated() {
        let failure1 = {
            let mut d = Document::new();
            d.put_binding(ValueBinding::new("GHOST", Scope::Default, Value::Plain("x".into())));
            d.put_binding(ValueBinding::new("GHOST", Scope::Environment("dev".into()), Value::Plain("y".into())));
            validate(&d, false)
        };
        let matching = failure1
            .violations
            .iter()
            .filter(|v| v.0.contains("GHOST") && v.0.contains("variable declaration"))
            .count();
        assert_eq!(matching, 1);
    }
}
