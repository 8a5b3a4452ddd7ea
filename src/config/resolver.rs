//! Password Resolver: obtain a password by running an external command.
//!
//! The configured value is an executable path (tilde-expanded), run with the
//! inherited environment, no arguments and no stdin. Whatever it prints to
//! stdout, minus one trailing newline, is the password. The child is fully
//! supervised: 10 second budget, 64 KiB stdout cap, killed on timeout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Error, Result};

const TIME_BUDGET: Duration = Duration::from_secs(10);
const MAX_STDOUT: usize = 64 * 1024;
const STDERR_TAIL: usize = 4 * 1024;

/// Run `command` and return the password it prints.
pub async fn resolve_command(command: &str) -> Result<String> {
    let bin = shellexpand::tilde(command).to_string();
    tracing::info!(command = %bin, "resolving password via command");

    let mut child = Command::new(&bin)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| Error::AuthFailure(format!("failed to run {bin}: {err}")))?;

    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

    let collect = async {
        let (out, err, status) = tokio::join!(
            async {
                // read one byte past the cap so oversize output is detectable
                let mut buf = Vec::new();
                let mut limited = stdout_pipe.take(MAX_STDOUT as u64 + 1);
                limited.read_to_end(&mut buf).await.map(|_| buf)
            },
            async {
                let mut buf = Vec::new();
                stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
            },
            child.wait(),
        );
        let stdout = out.map_err(|e| Error::AuthFailure(format!("reading {bin} stdout: {e}")))?;
        let stderr = err.unwrap_or_default();
        let status = status.map_err(|e| Error::AuthFailure(format!("waiting for {bin}: {e}")))?;
        Ok::<_, Error>((stdout, stderr, status))
    };

    let (stdout, stderr, status) = tokio::time::timeout(TIME_BUDGET, collect)
        .await
        .map_err(|_| {
            Error::AuthFailure(format!(
                "password command timed out after {}s: {bin}",
                TIME_BUDGET.as_secs()
            ))
        })??;

    for line in String::from_utf8_lossy(&stderr).lines() {
        tracing::info!(command = %bin, "{line}");
    }

    if !status.success() {
        use std::os::unix::process::ExitStatusExt;
        let how = status
            .code()
            .map(|c| format!("exit code {c}"))
            .or_else(|| status.signal().map(|s| format!("signal {s}")))
            .unwrap_or_else(|| "unknown status".to_owned());
        let tail = stderr_tail(&stderr);
        return Err(Error::AuthFailure(format!(
            "password command failed ({how}): {tail}"
        )));
    }

    if stdout.len() > MAX_STDOUT {
        return Err(Error::AuthFailure(format!(
            "password command printed more than {} bytes",
            MAX_STDOUT
        )));
    }

    let text = String::from_utf8(stdout)
        .map_err(|_| Error::AuthFailure("password command printed non-UTF-8 output".into()))?;
    let text = text.strip_suffix('\n').unwrap_or(&text);
    let text = text.strip_suffix('\r').unwrap_or(text);
    Ok(text.to_owned())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("cmd.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn captures_stdout_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "echo s3cr3t");
        assert_eq!(resolve_command(&cmd).await.unwrap(), "s3cr3t");
    }

    #[tokio::test]
    async fn only_one_newline_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "printf 'pw\\n\\n'");
        assert_eq!(resolve_command(&cmd).await.unwrap(), "pw\n");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "echo broken token >&2; exit 3");
        let err = resolve_command(&cmd).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("broken token"), "{msg}");
    }

    #[tokio::test]
    async fn oversized_stdout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(&dir, "head -c 70000 /dev/zero | tr '\\0' 'x'");
        let err = resolve_command(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("more than"));
    }

    #[tokio::test]
    async fn missing_executable_fails() {
        let err = resolve_command("/no/such/binary-hopefully").await.unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
    }
}
