//! Serialize a resolved variable mapping for `output`, and print the
//! document's full binding set for `tree` (§6.2, §6.5).

use std::collections::BTreeMap;

use serde_json;
use serde_yaml;

use envars_core::{Document, Scope};
use Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Dotenv,
    Yaml,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Format> {
        match raw {
            "dotenv" => Some(Format::Dotenv),
            "yaml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// §6.5: dotenv escapes newlines as `\n` and double-quotes every value; YAML
/// and JSON nest the mapping under an `envars` key.
pub fn render(resolved: &BTreeMap<String, String>, format: Format) -> Result<String> {
    match format {
        Format::Dotenv => Ok(render_dotenv(resolved)),
        Format::Yaml => {
            let mut wrapper = BTreeMap::new();
            wrapper.insert("envars".to_string(), resolved);
            Ok(serde_yaml::to_string(&wrapper)?)
        }
        Format::Json => {
            let mut wrapper = BTreeMap::new();
            wrapper.insert("envars".to_string(), resolved);
            Ok(serde_json::to_string_pretty(&wrapper)?)
        }
    }
}

fn render_dotenv(resolved: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in resolved {
        let escaped = value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"");
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escaped);
        out.push_str("\"\n");
    }
    out
}

/// `tree` prints the whole document: every variable, each of its bindings by
/// scope, and (unless `decrypt`) a `<secret>` placeholder instead of
/// ciphertext. `truncate` bounds how many characters of a raw value are shown.
///
/// `decrypted` holds the plaintext for every secret binding `tree` managed to
/// decrypt, keyed by `(variable, scope)`; a secret missing from it (decrypt
/// wasn't requested, or the KMS call failed) falls back to `<secret>` rather
/// than ever showing raw ciphertext.
pub fn render_tree(
    doc: &Document,
    decrypted: &BTreeMap<(String, Scope), String>,
    truncate: Option<usize>,
) -> String {
    let mut out = String::new();
    for (name, _) in &doc.variables {
        out.push_str(name);
        out.push('\n');
        for binding in doc.bindings_for(name) {
            let label = scope_label(doc, &binding.scope);
            let shown = if binding.value.is_secret() {
                match decrypted.get(&(name.clone(), binding.scope.clone())) {
                    Some(plaintext) => truncated(plaintext, truncate),
                    None => "<secret>".to_string(),
                }
            } else {
                truncated(binding.value.raw(), truncate)
            };
            out.push_str(&format!("  {}: {}\n", label, shown));
        }
    }
    out
}

fn scope_label(doc: &Document, scope: &Scope) -> String {
    match scope {
        Scope::Default => "default".to_string(),
        Scope::Environment(e) => e.clone(),
        Scope::Location(l) => doc.locations.get(l).map(|loc| loc.name.clone()).unwrap_or_else(|| l.clone()),
        Scope::Specific(e, l) => {
            let loc_name = doc.locations.get(l).map(|loc| loc.name.clone()).unwrap_or_else(|| l.clone());
            format!("{}/{}", e, loc_name)
        }
    }
}

fn truncated(raw: &str, limit: Option<usize>) -> String {
    match limit {
        Some(n) => {
            let mut chars = raw.chars();
            let head: String = chars.by_ref().take(n).collect();
            if chars.next().is_some() {
                format!("{}...", head)
            } else {
                head
            }
        }
        None => raw.to_string(),
    }
}
