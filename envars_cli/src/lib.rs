#![allow(non_snake_case)]

extern crate envars_core;

extern crate serde_json;
extern crate serde_yaml;

extern crate openssl_probe;

#[macro_use]
extern crate log;
extern crate loggerv;

#[macro_use]
extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Output rendering: dotenv/YAML/JSON serialization and the dependency tree
/// printer.
pub mod render;

/// Process execution: `exec` (replace the current process image with the
/// resolved environment) and `set-systemd-env`.
pub mod process;

/// One function per CLI subcommand (§6.2): the translation from parsed flags
/// to document load/mutate/resolve/write calls.
pub mod commands;

/// Smart initialiser with safety, mirroring the teacher's own `init()`.
///
/// Sets up SSL root certificates for any HTTPS client the resolution engine
/// reaches for, and lets `envars` be invoked from outside a manifest
/// directory when `ENVARS_MANIFEST_DIR` points at one.
pub fn init() -> Result<()> {
    use std::env;
    use std::path::Path;
    openssl_probe::init_ssl_cert_env_vars();

    if let Ok(mdir) = env::var("ENVARS_MANIFEST_DIR") {
        let pth = Path::new(&mdir);
        if !pth.is_dir() {
            bail!("ENVARS_MANIFEST_DIR must exist");
        }
        env::set_current_dir(pth)?;
    }

    Ok(())
}

/// The environment name to operate against: `--env` if given, else
/// `ENVARS_ENV`, else `None` (callers that require one turn this into
/// `ResolveErrKind::MissingEnv` / the equivalent CLI error).
pub fn selected_env(flag: Option<&str>) -> Option<String> {
    flag.map(str::to_string).or_else(|| std::env::var("ENVARS_ENV").ok())
}
