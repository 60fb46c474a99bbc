//! `exec` and `set-systemd-env`: the two commands that hand resolved
//! variables to something outside the `envars` process itself (§6.2).

use std::collections::BTreeMap;
use std::process::Command;

use Result;

/// Replace the current process image with `cmd`, injecting `env` into its
/// environment. On success this call never returns; failure to spawn
/// surfaces as a regular error so the caller can print it and exit 1.
///
/// Unix only: there is no portable `execvpe` equivalent, and `envars` is a
/// server/ops tool that only ever runs on Unix hosts.
#[cfg(unix)]
pub fn exec_replace(cmd: &[String], env: &BTreeMap<String, String>) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let (program, args) = cmd.split_first().ok_or_else(|| format_err!("exec requires a command"))?;
    let err = Command::new(program).args(args).envs(env).exec();
    Err(format_err!("exec {} failed: {}", program, err))
}

#[cfg(not(unix))]
pub fn exec_replace(_cmd: &[String], _env: &BTreeMap<String, String>) -> Result<()> {
    Err(format_err!("exec is only supported on Unix"))
}

/// Push every resolved variable into the user's systemd session manager via
/// `systemctl --user set-environment`, matching what a login shell's
/// `environment.d` would otherwise need a relogin to pick up.
pub fn set_systemd_env(env: &BTreeMap<String, String>) -> Result<()> {
    if env.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let status = Command::new("systemctl").arg("--user").arg("set-environment").args(&assignments).status()?;
    if !status.success() {
        return Err(format_err!("systemctl --user set-environment exited with {}", status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_systemd_env_is_a_noop_for_empty_mapping() {
        let env = BTreeMap::new();
        assert!(set_systemd_env(&env).is_ok());
    }
}
