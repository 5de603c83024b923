//! Command construction for model subprocesses.
//!
//! Templates arrive from the config layer with all macros expanded except
//! `${PORT}`. This module substitutes the port, splits the line into argv
//! and spawns the child with piped stdio feeding the log mux.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::process::{Child, Command};

use crate::logmux::LogMux;
use crate::process::stream::spawn_stream_reader;

/// Substitute the assigned port into a template.
#[must_use]
pub fn substitute_port(template: &str, port: u16) -> String {
    template.replace("${PORT}", &port.to_string())
}

/// Split an expanded command line and spawn it.
///
/// The child inherits the parent environment plus `env`, with stdout and
/// stderr piped for log capture. `kill_on_drop` is set so an abandoned
/// handle cannot leak a subprocess.
pub fn spawn_model_command(cmd_line: &str, env: &BTreeMap<String, String>) -> Result<Child> {
    let argv = shell_words::split(cmd_line).context("invalid command template")?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command template"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn()
        .with_context(|| format!("failed to spawn {program}"))
}

/// Attach both output pipes to the log mux, tagged with the model id.
pub fn spawn_log_readers(child: &mut Child, source: &str, logs: &Arc<LogMux>) {
    if let Some(stdout) = child.stdout.take() {
        spawn_stream_reader(stdout, source.to_string(), "stdout", Arc::clone(logs));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_stream_reader(stderr, source.to_string(), "stderr", Arc::clone(logs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_port_occurrence() {
        let out = substitute_port("server --port ${PORT} --url http://x:${PORT}", 9123);
        assert_eq!(out, "server --port 9123 --url http://x:9123");
    }

    #[test]
    fn rejects_empty_template() {
        let err = spawn_model_command("", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("empty command template"));
    }

    #[tokio::test]
    async fn spawns_with_extra_env() {
        let mut env = BTreeMap::new();
        env.insert("CLARA_TEST_VALUE".to_string(), "42".to_string());

        let mut child =
            spawn_model_command("sh -c 'printf \"%s\" \"$CLARA_TEST_VALUE\"'", &env).unwrap();
        let stdout = child.stdout.take().unwrap();
        child.wait().await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = String::new();
        tokio::io::BufReader::new(stdout)
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "42");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn spawns_a_script_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-server");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cmd_line = format!("{} --port 9000", script.display());
        let mut child = spawn_model_command(&cmd_line, &BTreeMap::new()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[test]
    fn splits_quoted_arguments() {
        // shell-words keeps quoted spans intact
        let argv = shell_words::split("server -m '/models/my model.gguf' --port 1").unwrap();
        assert_eq!(argv[2], "/models/my model.gguf");
    }
}
