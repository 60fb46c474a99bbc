//! One function per subcommand in §6.2, each taking the parsed flags for that
//! subcommand and doing exactly the I/O the command needs: load, mutate or
//! resolve, write or print. Kept free of `clap::ArgMatches` so the parsing
//! layer in `main` stays a thin translation from flags to these signatures.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use envars_core::kms::{AwsKms, EncryptionContext, GcpKms, KmsAdapter};
use envars_core::{codec, document, identity, mutate, resolve, validate, Document};

use render::{render, render_tree, Format};
use {process, selected_env, Result};

/// Shared plumbing every subcommand but `init` starts with: load the
/// document from `file`, failing with a message that nudges the caller
/// toward `init` when the file doesn't exist yet.
fn load(file: &str) -> Result<Document> {
    if !Path::new(file).exists() {
        bail!("{} not found - use 'init' to create a new file", file);
    }
    codec::load_file(file)
}

/// Resolve `--loc` against the document: an explicit name is validated, an
/// absent one falls back to the ambient cloud identity probe. Returns `None`
/// when neither source yields a location - resolution proceeds without one.
fn resolve_location<'a>(doc: &Document, loc: Option<&'a str>) -> Result<Option<String>> {
    match loc {
        Some(name) => {
            if !doc.has_location_name(name) {
                bail!("no such location: {}", name);
            }
            Ok(Some(name.to_string()))
        }
        None => Ok(identity::detect_location_name(doc)),
    }
}

fn parse_locations(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(2, ':');
            let name = parts.next().unwrap_or("");
            let id = parts.next().ok_or_else(|| format_err!("invalid location format: {} - use name:id", entry))?;
            Ok((name.to_string(), id.to_string()))
        })
        .collect()
}

fn parse_envs(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

pub fn init(
    file: &str,
    app: &str,
    env: &str,
    loc: Option<&str>,
    kms_key: Option<&str>,
    force: bool,
    description_mandatory: bool,
) -> Result<()> {
    if Path::new(file).exists() && !force {
        bail!("{} already exists - pass --force to overwrite", file);
    }
    let envs = parse_envs(env);
    let locs = match loc {
        Some(raw) => parse_locations(raw)?,
        None => Vec::new(),
    };
    let doc = mutate::init(app, &envs, &locs, kms_key, description_mandatory);
    codec::write_file(&doc, file)?;
    println!("initialized {}", file);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn add(
    file: &str,
    var_assignment: Option<&str>,
    var_name: Option<&str>,
    value_from_file: Option<&str>,
    env: Option<&str>,
    loc: Option<&str>,
    secret: bool,
    no_secret: bool,
    description: Option<&str>,
    validation: Option<&str>,
) -> Result<()> {
    let mut doc = load(file)?;

    let (name, raw_value) = match (var_assignment, var_name, value_from_file) {
        (Some(assignment), None, None) => {
            let mut parts = assignment.splitn(2, '=');
            let name = parts.next().unwrap_or("");
            let value = parts
                .next()
                .ok_or_else(|| format_err!("invalid variable assignment '{}' - use VAR=value", assignment))?;
            (name.to_string(), value.to_string())
        }
        (None, Some(name), Some(path)) => {
            let value = fs::read_to_string(path)?;
            (name.to_string(), value)
        }
        _ => bail!("pass either VAR=value or --var-name/--value-from-file, not both"),
    };

    if !document::is_valid_variable_name(&name) {
        bail!("variable names must be uppercase: {}", name);
    }

    let explicit_sensitivity = if secret { Some(true) } else if no_secret { Some(false) } else { None };
    let is_secret = mutate::resolve_sensitivity(&name, explicit_sensitivity)?;

    let loc_id = match loc {
        Some(loc_name) => Some(
            doc.location_id_by_name(loc_name)
                .ok_or_else(|| format_err!("no such location: {}", loc_name))?
                .to_string(),
        ),
        None => None,
    };
    let scope = match (env, loc_id.as_deref()) {
        (Some(e), Some(l)) => document::Scope::Specific(e.to_string(), l.to_string()),
        (Some(e), None) => document::Scope::Environment(e.to_string()),
        (None, Some(l)) => document::Scope::Location(l.to_string()),
        (None, None) => document::Scope::Default,
    };

    let stored_value = if is_secret {
        let kms_key = doc
            .kms_key_for_scope(&scope)
            .map(str::to_string)
            .ok_or_else(|| format_err!("cannot encrypt without a kms_key in configuration"))?;
        let ctx = EncryptionContext {
            app: doc.app.clone().unwrap_or_default(),
            env: scope.environment().map(str::to_string),
            location: loc.map(str::to_string),
        };
        if kms_key.starts_with("projects/") {
            GcpKms::live().encrypt(&raw_value, &kms_key, &ctx)?
        } else {
            AwsKms::live().encrypt(&raw_value, &kms_key, &ctx)?
        }
    } else {
        raw_value
    };

    mutate::add_binding(&mut doc, &name, scope, &stored_value, Some(is_secret), description, validation)?;
    codec::write_file(&doc, file)?;
    println!("added/updated {} in {}", name, file);
    Ok(())
}

pub fn output(file: &str, env: Option<&str>, loc: Option<&str>, format: &str) -> Result<()> {
    let doc = load(file)?;
    let env = selected_env(env).ok_or_else(|| format_err!("no environment given: pass --env or set ENVARS_ENV"))?;
    let loc = resolve_location(&doc, loc)?;
    let resolved = resolve::resolve(&doc, Some(&env), loc.as_deref(), true)?;
    let fmt = Format::parse(format).ok_or_else(|| format_err!("unknown format: {} (use dotenv, yaml or json)", format))?;
    print!("{}", render(&resolved, fmt)?);
    Ok(())
}

pub fn tree(file: &str, decrypt: bool, truncate: Option<usize>) -> Result<()> {
    let doc = load(file)?;
    let decrypted = if decrypt { decrypt_every_secret(&doc) } else { BTreeMap::new() };
    print!("{}", render_tree(&doc, &decrypted, truncate));
    Ok(())
}

/// Best-effort decrypt of every secret binding for `tree --decrypt`: a
/// binding that fails (wrong region, no credentials, revoked key) is simply
/// left out of the map so `render_tree` falls back to `<secret>` for it,
/// rather than aborting the whole listing over one bad key.
fn decrypt_every_secret(doc: &Document) -> BTreeMap<(String, document::Scope), String> {
    let mut out = BTreeMap::new();
    for binding in &doc.bindings {
        let ciphertext = match &binding.value {
            document::Value::Secret(ct) => ct,
            document::Value::Plain(_) => continue,
        };
        let key = match doc.kms_key_for_scope(&binding.scope) {
            Some(k) => k,
            None => continue,
        };
        let ctx = EncryptionContext {
            app: doc.app.clone().unwrap_or_default(),
            env: binding.scope.environment().map(str::to_string),
            location: binding
                .scope
                .location_id()
                .map(|id| doc.locations.get(id).map(|l| l.name.clone()).unwrap_or_else(|| id.to_string())),
        };
        let plaintext = if key.starts_with("projects/") {
            GcpKms::live().decrypt(ciphertext, key, &ctx)
        } else {
            AwsKms::live().decrypt(ciphertext, key, &ctx)
        };
        if let Ok(plaintext) = plaintext {
            out.insert((binding.variable.clone(), binding.scope.clone()), plaintext);
        }
    }
    out
}

pub fn exec(file: &str, env: Option<&str>, loc: Option<&str>, cmd: &[String]) -> Result<()> {
    if cmd.is_empty() {
        bail!("no command provided");
    }
    let doc = load(file)?;
    let env = selected_env(env).ok_or_else(|| format_err!("no environment given: pass --env or set ENVARS_ENV"))?;
    let loc = resolve_location(&doc, loc)?;
    let resolved = resolve::resolve(&doc, Some(&env), loc.as_deref(), true)?;
    process::exec_replace(cmd, &resolved)
}

pub fn set_systemd_env(file: &str, env: Option<&str>, loc: Option<&str>) -> Result<()> {
    let doc = load(file)?;
    let env = selected_env(env).ok_or_else(|| format_err!("no environment given: pass --env or set ENVARS_ENV"))?;
    let loc = resolve_location(&doc, loc)?;
    let resolved = resolve::resolve(&doc, Some(&env), loc.as_deref(), true)?;
    process::set_systemd_env(&resolved)?;
    println!("pushed {} variable(s) to the user session manager", resolved.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn config(
    file: &str,
    kms_key: Option<&str>,
    add_env: Option<&str>,
    remove_env: Option<&str>,
    add_loc: Option<&str>,
    remove_loc: Option<&str>,
    description_mandatory: Option<bool>,
) -> Result<()> {
    if kms_key.is_none()
        && add_env.is_none()
        && remove_env.is_none()
        && add_loc.is_none()
        && remove_loc.is_none()
        && description_mandatory.is_none()
    {
        bail!("no configuration change given - pass --kms-key, --add-env, --remove-env, --add-loc, --remove-loc, or --description-mandatory/--no-description-mandatory");
    }
    let mut doc = load(file)?;

    if let Some(k) = kms_key {
        mutate::set_kms_key(&mut doc, Some(k));
    }
    if let Some(name) = add_env {
        mutate::add_environment(&mut doc, name);
    }
    if let Some(name) = remove_env {
        mutate::remove_environment(&mut doc, name)?;
    }
    if let Some(raw) = add_loc {
        let (name, id) = parse_locations(raw)?.pop().ok_or_else(|| format_err!("invalid --add-loc value: {}", raw))?;
        mutate::add_location(&mut doc, &name, &id);
    }
    if let Some(name) = remove_loc {
        mutate::remove_location(&mut doc, name)?;
    }
    if let Some(mandatory) = description_mandatory {
        mutate::set_description_mandatory(&mut doc, mandatory);
    }

    codec::write_file(&doc, file)?;
    println!("updated configuration in {}", file);
    Ok(())
}

pub fn rotate_kms_key(file: &str, new_kms_key: &str, output_file: &str) -> Result<()> {
    let doc = load(file)?;
    let adapters = mutate::RotationAdapters::live();
    let rotated = mutate::rotate_kms_key(&doc, new_kms_key, &adapters)?;
    codec::write_file(&rotated, output_file)?;
    println!("rotated kms key, wrote {}", output_file);
    Ok(())
}

pub fn validate_cmd(file: &str, ignore_default_secrets: bool) -> Result<()> {
    let doc = load(file)?;
    let failure = validate::validate(&doc, ignore_default_secrets);
    if !failure.is_empty() {
        bail!("{}", failure);
    }
    println!("validation successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_locations_splits_name_and_id() {
        let locs = parse_locations("aws:111,gcp:222").unwrap();
        assert_eq!(locs, vec![("aws".to_string(), "111".to_string()), ("gcp".to_string(), "222".to_string())]);
    }

    #[test]
    fn parse_locations_rejects_missing_colon() {
        assert!(parse_locations("aws").is_err());
    }

    #[test]
    fn parse_envs_trims_and_splits() {
        assert_eq!(parse_envs(" dev , prod "), vec!["dev".to_string(), "prod".to_string()]);
    }
}
