use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::Path;

use failure::{Backtrace, Context, Error, Fail, ResultExt};
use serde::de::{Deserialize, Deserializer, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde_yaml::Value as Yaml;

use document::{Document, Environment, Location, Scope, Value, ValueBinding, Variable, is_valid_variable_name};
use Result;

const SECRET_TAG: &str = "!secret";
const RESERVED_KEYS: [&str; 3] = ["description", "validation", "default"];

#[derive(Debug)]
pub struct CodecError {
    inner: Context<CodecErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum CodecErrKind {
    #[fail(display = "invalid document: {}", _0)]
    InvalidDocument(String),

    #[fail(display = "invalid variable name '{}': must equal its own uppercase form", _0)]
    InvalidName(String),

    #[fail(display = "invalid nesting under variable '{}', key '{}': mapping of a mapping is not allowed", _0, _1)]
    InvalidNesting(String, String),

    #[fail(display = "key '{}' under variable '{}' is neither an environment, a location nor a reserved key", _1, _0)]
    UnknownScopeKey(String, String),
}

impl Fail for CodecError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<CodecErrKind> for CodecError {
    fn from(kind: CodecErrKind) -> CodecError {
        CodecError { inner: Context::new(kind) }
    }
}
impl From<Context<CodecErrKind>> for CodecError {
    fn from(inner: Context<CodecErrKind>) -> CodecError {
        CodecError { inner }
    }
}

/// Load a document from a file path. A missing or empty file loads to an
/// empty `Document`, per §4.1's "empty documents load to an empty model".
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Document> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<Document> {
    if text.trim().is_empty() {
        return Ok(Document::new());
    }
    reject_duplicate_keys(text)?;
    let root: Yaml = serde_yaml::from_str(text).context(CodecErrKind::InvalidDocument(
        "not valid YAML".into(),
    ))?;

    let mut doc = Document::new();
    let config = root.get("configuration");
    if let Some(config) = config {
        load_configuration(&mut doc, config)?;
    }
    if let Some(vars) = root.get("environment_variables") {
        load_variables(&mut doc, vars)?;
    }
    Ok(doc)
}

fn load_configuration(doc: &mut Document, config: &Yaml) -> Result<()> {
    if let Some(app) = config.get("app").and_then(Yaml::as_str) {
        doc.app = Some(app.to_string());
    }
    if let Some(kms_key) = config.get("kms_key").and_then(Yaml::as_str) {
        doc.kms_key = Some(kms_key.to_string());
    }
    if let Some(dm) = config.get("description_mandatory").and_then(Yaml::as_bool) {
        doc.description_mandatory = dm;
    }
    if let Some(Yaml::Sequence(envs)) = config.get("environments") {
        for e in envs {
            let name = e.as_str().ok_or_else(|| {
                Error::from(CodecErrKind::InvalidDocument("environment name must be a string".into()))
            })?;
            doc.environments.insert(name.to_string(), Environment::new(name));
        }
    }
    if let Some(Yaml::Sequence(locs)) = config.get("locations") {
        for entry in locs {
            let mapping = entry.as_mapping().ok_or_else(|| {
                Error::from(CodecErrKind::InvalidDocument("location entry must be a single-key mapping".into()))
            })?;
            for (name_v, spec_v) in mapping {
                let name = name_v.as_str().ok_or_else(|| {
                    Error::from(CodecErrKind::InvalidDocument("location name must be a string".into()))
                })?;
                let mut location = match spec_v {
                    Yaml::String(id) => Location::new(name, id.clone()),
                    Yaml::Number(n) => Location::new(name, n.to_string()),
                    Yaml::Mapping(_) => {
                        let id = spec_v
                            .get("id")
                            .and_then(Yaml::as_str)
                            .ok_or_else(|| Error::from(CodecErrKind::InvalidDocument(
                                format!("location '{}' is missing 'id'", name),
                            )))?;
                        Location::new(name, id)
                    }
                    _ => {
                        return Err(CodecErrKind::InvalidDocument(
                            format!("location '{}' has an unsupported value", name),
                        )
                        .into())
                    }
                };
                if let Yaml::Mapping(_) = spec_v {
                    if let Some(k) = spec_v.get("kms_key").and_then(Yaml::as_str) {
                        location.kms_key = Some(k.to_string());
                    }
                }
                doc.locations.insert(location.id.clone(), location);
            }
        }
    }
    Ok(())
}

fn load_variables(doc: &mut Document, vars: &Yaml) -> Result<()> {
    let mapping = match vars {
        Yaml::Mapping(m) => m,
        Yaml::Null => return Ok(()),
        _ => return Err(CodecErrKind::InvalidDocument("environment_variables must be a mapping".into()).into()),
    };

    for (name_v, block_v) in mapping {
        let name = name_v
            .as_str()
            .ok_or_else(|| Error::from(CodecErrKind::InvalidDocument("variable name must be a string".into())))?;
        if !is_valid_variable_name(name) {
            return Err(CodecErrKind::InvalidName(name.to_string()).into());
        }
        let mut variable = Variable::new(name);

        let block = block_v
            .as_mapping()
            .ok_or_else(|| Error::from(CodecErrKind::InvalidDocument(format!("variable '{}' must be a mapping", name))))?;

        for (key_v, value_v) in block {
            let key = key_v
                .as_str()
                .ok_or_else(|| Error::from(CodecErrKind::InvalidDocument(format!("key under '{}' must be a string", name))))?;

            if key == "description" {
                variable.description = value_v.as_str().map(str::to_string);
                continue;
            }
            if key == "validation" {
                variable.validation = value_v.as_str().map(str::to_string);
                continue;
            }
            if key == "default" {
                let value = parse_value(value_v)?;
                doc.put_binding(ValueBinding::new(name, Scope::Default, value));
                continue;
            }

            let is_env = doc.has_environment(key);
            let is_loc = doc.has_location_name(key);

            if is_env {
                match value_v {
                    Yaml::Mapping(inner) => {
                        for (loc_name_v, inner_val) in inner {
                            let loc_name = loc_name_v.as_str().ok_or_else(|| {
                                Error::from(CodecErrKind::InvalidNesting(name.to_string(), key.to_string()))
                            })?;
                            if inner_val.as_mapping().is_some() {
                                return Err(CodecErrKind::InvalidNesting(name.to_string(), key.to_string()).into());
                            }
                            let loc_id = doc
                                .location_id_by_name(loc_name)
                                .ok_or_else(|| Error::from(CodecErrKind::UnknownScopeKey(name.to_string(), loc_name.to_string())))?
                                .to_string();
                            let value = parse_value(inner_val)?;
                            doc.put_binding(ValueBinding::new(
                                name,
                                Scope::Specific(key.to_string(), loc_id),
                                value,
                            ));
                        }
                    }
                    _ => {
                        let value = parse_value(value_v)?;
                        doc.put_binding(ValueBinding::new(name, Scope::Environment(key.to_string()), value));
                    }
                }
                continue;
            }

            if is_loc {
                let loc_id = doc.location_id_by_name(key).unwrap().to_string();
                match value_v {
                    Yaml::Mapping(inner) => {
                        for (env_name_v, inner_val) in inner {
                            let env_name = env_name_v.as_str().ok_or_else(|| {
                                Error::from(CodecErrKind::InvalidNesting(name.to_string(), key.to_string()))
                            })?;
                            if inner_val.as_mapping().is_some() {
                                return Err(CodecErrKind::InvalidNesting(name.to_string(), key.to_string()).into());
                            }
                            if !doc.has_environment(env_name) {
                                return Err(CodecErrKind::UnknownScopeKey(name.to_string(), env_name.to_string()).into());
                            }
                            let value = parse_value(inner_val)?;
                            doc.put_binding(ValueBinding::new(
                                name,
                                Scope::Specific(env_name.to_string(), loc_id.clone()),
                                value,
                            ));
                        }
                    }
                    _ => {
                        let value = parse_value(value_v)?;
                        doc.put_binding(ValueBinding::new(name, Scope::Location(loc_id), value));
                    }
                }
                continue;
            }

            return Err(CodecErrKind::UnknownScopeKey(name.to_string(), key.to_string()).into());
        }

        doc.variables.insert(name.to_string(), variable);
    }
    Ok(())
}

fn parse_value(v: &Yaml) -> Result<Value> {
    if let Yaml::Tagged(t) = v {
        if t.tag.to_string().trim_start_matches('!') == SECRET_TAG.trim_start_matches('!') {
            let s = t.value.as_str().ok_or_else(|| {
                Error::from(CodecErrKind::InvalidDocument("secret tag must wrap a string scalar".into()))
            })?;
            return Ok(Value::Secret(s.to_string()));
        }
        return Err(CodecErrKind::InvalidDocument(format!("unsupported tag '{}'", t.tag)).into());
    }
    let s = v
        .as_str()
        .ok_or_else(|| Error::from(CodecErrKind::InvalidDocument("binding value must be a string".into())))?;
    Ok(Value::Plain(s.to_string()))
}

/// A structural echo of a YAML document, built straight from the parser's
/// map/sequence callbacks rather than from an already-deserialized
/// `serde_yaml::Value`. `Value::Mapping` is an index map: by the time a
/// document has become a `Value`, a repeated key has already been silently
/// collapsed, so a tree-walk over that `Value` can never observe the
/// duplicate. This type's `visit_map` instead rejects a repeated key the
/// moment the deserializer yields it, before anything has collapsed it into
/// a map. The leaves carry no data - only the shape matters here.
enum DupCheck {
    Leaf,
    Sequence(Vec<DupCheck>),
    Mapping(Vec<(String, DupCheck)>),
}

impl<'de> Deserialize<'de> for DupCheck {
    fn deserialize<D>(deserializer: D) -> ::std::result::Result<DupCheck, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DupCheckVisitor;

        impl<'de> Visitor<'de> for DupCheckVisitor {
            type Value = DupCheck;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "any YAML value")
            }

            fn visit_bool<E>(self, _v: bool) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_i64<E>(self, _v: i64) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_u64<E>(self, _v: u64) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_f64<E>(self, _v: f64) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_str<E>(self, _v: &str) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_string<E>(self, _v: String) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_unit<E>(self) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_none<E>(self) -> ::std::result::Result<DupCheck, E> {
                Ok(DupCheck::Leaf)
            }
            fn visit_some<D2>(self, deserializer: D2) -> ::std::result::Result<DupCheck, D2::Error>
            where
                D2: Deserializer<'de>,
            {
                DupCheck::deserialize(deserializer)
            }
            fn visit_newtype_struct<D2>(self, deserializer: D2) -> ::std::result::Result<DupCheck, D2::Error>
            where
                D2: Deserializer<'de>,
            {
                DupCheck::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> ::std::result::Result<DupCheck, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<DupCheck>()? {
                    items.push(item);
                }
                Ok(DupCheck::Sequence(items))
            }

            fn visit_map<A>(self, mut map: A) -> ::std::result::Result<DupCheck, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen: BTreeSet<String> = BTreeSet::new();
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, DupCheck>()? {
                    if !seen.insert(key.clone()) {
                        return Err(<A::Error as ::serde::de::Error>::custom(format!(
                            "duplicate key '{}'",
                            key
                        )));
                    }
                    entries.push((key, value));
                }
                Ok(DupCheck::Mapping(entries))
            }

            // `!secret`-tagged scalars arrive through the enum path: serde_yaml
            // represents a custom tag as a variant name over its content.
            fn visit_enum<A>(self, data: A) -> ::std::result::Result<DupCheck, A::Error>
            where
                A: EnumAccess<'de>,
            {
                let (_tag, variant): (String, _) = data.variant()?;
                variant.newtype_variant::<DupCheck>()
            }
        }

        deserializer.deserialize_any(DupCheckVisitor)
    }
}

/// Fail with `InvalidDocument` the moment the same key appears twice at the
/// same nesting level, anywhere in `text`. Must run against the raw text
/// before `serde_yaml::from_str::<Yaml>` has a chance to collapse the
/// duplicate (see `DupCheck`). Any other parse problem is left for that
/// later call to report, so its message stays consistent across every other
/// kind of malformed document.
fn reject_duplicate_keys(text: &str) -> Result<()> {
    if let Err(e) = serde_yaml::from_str::<DupCheck>(text) {
        let msg = e.to_string();
        if msg.contains("duplicate key") {
            return Err(CodecErrKind::InvalidDocument(msg).into());
        }
    }
    Ok(())
}

/// Serialize a document to the canonical textual form (§4.1 writer contract).
pub fn write_str(doc: &Document) -> Result<String> {
    let mut out = String::new();
    out.push_str("configuration:\n");
    if let Some(app) = &doc.app {
        out.push_str(&format!("  app: {}\n", app));
    }
    if let Some(kms_key) = &doc.kms_key {
        out.push_str(&format!("  kms_key: {}\n", kms_key));
    }
    out.push_str(&format!("  description_mandatory: {}\n", doc.description_mandatory));

    out.push_str("  environments:\n");
    for name in doc.environments.keys() {
        out.push_str(&format!("    - {}\n", name));
    }

    out.push_str("  locations:\n");
    let mut locs: Vec<&Location> = doc.locations.values().collect();
    locs.sort_by(|a, b| a.name.cmp(&b.name));
    for loc in locs {
        match &loc.kms_key {
            None => out.push_str(&format!("    - {}: \"{}\"\n", loc.name, loc.id)),
            Some(k) => {
                out.push_str(&format!("    - {}:\n", loc.name));
                out.push_str(&format!("        id: \"{}\"\n", loc.id));
                out.push_str(&format!("        kms_key: {}\n", k));
            }
        }
    }

    out.push('\n');
    out.push_str("environment_variables:\n");

    for (idx, (var_name, variable)) in doc.variables.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        out.push_str(&format!("  {}:\n", var_name));
        if let Some(d) = &variable.description {
            out.push_str(&format!("    description: {}\n", yaml_scalar(d)));
        }
        if let Some(v) = &variable.validation {
            out.push_str(&format!("    validation: {}\n", yaml_scalar(v)));
        }

        write_variable_block(&mut out, doc, var_name);
    }

    Ok(out)
}

/// A variable's scoped bindings grouped by outer key, ready for emission.
///
/// A `SPECIFIC(e, l)` binding and an `ENVIRONMENT(e)` binding for the same `e`
/// cannot both occupy the outer key `e` in one pass — the format allows a key's
/// value to be a scalar *or* a nested mapping, never both. When a variable
/// carries both, the SPECIFIC entries win and the ENVIRONMENT scalar is
/// dropped from the written form; this mirrors `write_envars_yml`'s
/// `var_data[env] = dict(...)` overwrite in `original_source`.
enum Entry {
    Scalar(Value),
    Map(::std::collections::BTreeMap<String, Value>),
}

fn write_variable_block(out: &mut String, doc: &Document, var_name: &str) {
    let mut entries: ::std::collections::BTreeMap<String, Entry> = ::std::collections::BTreeMap::new();

    for b in doc.bindings_for(var_name) {
        if let Scope::Environment(e) = &b.scope {
            entries.insert(e.clone(), Entry::Scalar(b.value.clone()));
        }
    }
    for b in doc.bindings_for(var_name) {
        if let Scope::Location(l) = &b.scope {
            let name = doc.locations.get(l).map(|loc| loc.name.clone()).unwrap_or_else(|| l.clone());
            entries.insert(name, Entry::Scalar(b.value.clone()));
        }
    }
    for b in doc.bindings_for(var_name) {
        if let Scope::Specific(e, l) = &b.scope {
            let loc_name = doc.locations.get(l).map(|loc| loc.name.clone()).unwrap_or_else(|| l.clone());
            match entries.get_mut(e) {
                Some(Entry::Map(m)) => {
                    m.insert(loc_name, b.value.clone());
                }
                _ => {
                    let mut m = ::std::collections::BTreeMap::new();
                    m.insert(loc_name, b.value.clone());
                    entries.insert(e.clone(), Entry::Map(m));
                }
            }
        }
    }

    if let Some(default) = doc.bindings_for(var_name).find(|b| b.scope == Scope::Default) {
        out.push_str(&format!("    default: {}\n", value_literal(&default.value, 4)));
    }

    for (key, entry) in &entries {
        match entry {
            Entry::Scalar(v) => out.push_str(&format!("    {}: {}\n", key, value_literal(v, 4))),
            Entry::Map(m) => {
                out.push_str(&format!("    {}:\n", key));
                for (loc_name, v) in m {
                    out.push_str(&format!("      {}: {}\n", loc_name, value_literal(v, 6)));
                }
            }
        }
    }
}

/// `key_indent` is the column the key itself sits at (4 for `default:`/a
/// scope scalar, 6 for a location nested under a SPECIFIC environment key).
/// A block scalar's body has to be indented deeper than its key or the YAML
/// doesn't parse, so the body always sits two columns past it.
fn value_literal(v: &Value, key_indent: usize) -> String {
    match v {
        Value::Plain(s) => yaml_scalar(s),
        Value::Secret(s) => format!("{} |\n{}", SECRET_TAG, indent_block(s, key_indent + 2)),
    }
}

fn indent_block(s: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    s.lines().map(|line| format!("{}{}", pad, line)).collect::<Vec<_>>().join("\n")
}

fn yaml_scalar(s: &str) -> String {
    if s.is_empty() || s.contains(':') || s.contains('#') || s.starts_with(|c: char| c == '!' || c == '&' || c == '*') {
        format!("{:?}", s)
    } else {
        s.to_string()
    }
}

pub fn write_file<P: AsRef<Path>>(doc: &Document, path: P) -> Result<()> {
    let text = write_str(doc)?;
    File::create(path)?.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use document::{Scope, Value};

    #[test]
    fn empty_document_loads_empty() {
        let d = load_str("").unwrap();
        assert!(d.environments.is_empty());
        assert!(d.bindings.is_empty());
    }

    #[test]
    fn rejects_duplicate_keys() {
        let text = "configuration:\n  app: x\nenvironment_variables:\n  FOO:\n    default: a\n    default: b\n";
        let err = load_str(text).unwrap_err();
        assert!(format!("{}", err).contains("duplicate key"));
    }

    #[test]
    fn rejects_lowercase_variable_name() {
        let text = "configuration:\n  environments: [dev]\nenvironment_variables:\n  foo:\n    dev: a\n";
        let err = load_str(text).unwrap_err();
        assert!(format!("{}", err).contains("must equal its own uppercase form"));
    }

    #[test]
    fn round_trip_precedence_scopes() {
        let text = "configuration:\n  app: demo\n  environments:\n    - dev\n    - prod\n  locations:\n    - aws: \"111\"\n    - gcp: \"222\"\nenvironment_variables:\n  API_KEY:\n    default: d\n    dev: de\n    aws: al\n    prod:\n      gcp: sp\n";
        let doc = load_str(text).unwrap();
        assert_eq!(doc.get_binding("API_KEY", None, None).unwrap().value.raw(), "d");
        assert_eq!(doc.get_binding("API_KEY", Some("dev"), Some("222")).unwrap().value.raw(), "de");
        assert_eq!(doc.get_binding("API_KEY", Some("prod"), Some("111")).unwrap().value.raw(), "al");
        assert_eq!(doc.get_binding("API_KEY", Some("prod"), Some("222")).unwrap().value.raw(), "sp");

        let written = write_str(&doc).unwrap();
        let reloaded = load_str(&written).unwrap();
        assert_eq!(reloaded.get_binding("API_KEY", Some("prod"), Some("222")).unwrap().value.raw(), "sp");
        assert_eq!(reloaded.get_binding("API_KEY", Some("dev"), Some("222")).unwrap().value.raw(), "de");
    }

    #[test]
    fn rejects_unknown_scope_key() {
        let text = "configuration:\n  environments: [dev]\nenvironment_variables:\n  FOO:\n    staging: a\n";
        let err = load_str(text).unwrap_err();
        assert!(format!("{}", err).contains("neither an environment"));
    }

    #[test]
    fn rejects_triple_nesting() {
        let text = "configuration:\n  environments: [dev]\n  locations:\n    - aws: \"1\"\nenvironment_variables:\n  FOO:\n    dev:\n      aws:\n        extra: a\n";
        let err = load_str(text).unwrap_err();
        assert!(format!("{}", err).contains("invalid nesting") || format!("{}", err).to_lowercase().contains("mapping"));
    }

    #[test]
    fn secret_tag_round_trips() {
        let mut doc = Document::new();
        doc.environments.insert("dev".into(), Environment::new("dev"));
        doc.variables.insert("TOKEN".into(), Variable::new("TOKEN"));
        doc.put_binding(ValueBinding::new("TOKEN", Scope::Environment("dev".into()), Value::Secret("AQICAHj==".into())));
        let written = write_str(&doc).unwrap();
        assert!(written.contains("!secret"));
        let reloaded = load_str(&written).unwrap();
        let b = reloaded.get_binding("TOKEN", Some("dev"), None).unwrap();
        assert!(b.value.is_secret());
        assert_eq!(b.value.raw(), "AQICAHj==");
    }

    #[test]
    fn secret_tag_round_trips_at_specific_scope() {
        let mut doc = Document::new();
        doc.environments.insert("prod".into(), Environment::new("prod"));
        doc.locations.insert("111".into(), Location::new("aws", "111"));
        doc.variables.insert("TOKEN".into(), Variable::new("TOKEN"));
        doc.put_binding(ValueBinding::new(
            "TOKEN",
            Scope::Specific("prod".into(), "111".into()),
            Value::Secret("line one\nline two".into()),
        ));
        let written = write_str(&doc).unwrap();
        let reloaded = load_str(&written).unwrap_or_else(|e| panic!("re-parsing written document: {}\n---\n{}", e, written));
        let b = reloaded.get_binding("TOKEN", Some("prod"), Some("111")).unwrap();
        assert!(b.value.is_secret());
        assert_eq!(b.value.raw(), "line one\nline two");
    }

    #[test]
    fn rejects_duplicate_keys_nested_under_specific_scope() {
        let text = "configuration:\n  app: x\n  environments: [prod]\n  locations:\n    - aws: \"1\"\nenvironment_variables:\n  FOO:\n    prod:\n      aws: a\n      aws: b\n";
        let err = load_str(text).unwrap_err();
        assert!(format!("{}", err).contains("duplicate key"));
    }
}
