use anyhow::{Result, anyhow};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct ScriptRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait ScriptRunner {
    fn run(
        &self,
        script: &Path,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ScriptRunResult>;
}

/// Runs Python scripts through whatever interpreter the platform provides.
#[derive(Debug, Default)]
pub struct PlatformScriptRunner;

impl ScriptRunner for PlatformScriptRunner {
    fn run(
        &self,
        script: &Path,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ScriptRunResult> {
        let mut child = spawn_interpreter(script, args, cwd)?;

        let status = child.wait_timeout(timeout)?;
        if status.is_none() {
            child.kill()?;
            let output = child.wait_with_output()?;
            return Ok(ScriptRunResult {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: true,
            });
        }

        let output = child.wait_with_output()?;
        Ok(ScriptRunResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        })
    }
}

fn spawn_interpreter(script: &Path, args: &[String], cwd: &Path) -> Result<Child> {
    let mut errors = Vec::new();
    for interpreter in candidate_interpreters() {
        let mut command = Command::new(interpreter);
        command.arg(script);
        command.args(args);
        command.current_dir(cwd);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{interpreter}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn interpreter for '{}': {}",
        script.display(),
        errors.join(" | ")
    ))
}

#[cfg(target_os = "windows")]
fn candidate_interpreters() -> &'static [&'static str] {
    &["python", "py"]
}

#[cfg(not(target_os = "windows"))]
fn candidate_interpreters() -> &'static [&'static str] {
    &["python3", "python"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn python_available() -> bool {
        candidate_interpreters().iter().any(|interpreter| {
            Command::new(interpreter)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok()
        })
    }

    #[test]
    fn runner_captures_stdout_and_exit_code() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("hello.py");
        fs::write(&script, "print('hello from script')\n").expect("script");

        let out = PlatformScriptRunner
            .run(&script, &[], dir.path(), Duration::from_secs(10))
            .expect("run script");
        assert!(!out.timed_out);
        assert_eq!(out.status, Some(0));
        assert!(out.stdout.contains("hello from script"));
    }

    #[test]
    fn runner_reports_nonzero_exit() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("fail.py");
        fs::write(&script, "import sys\nsys.exit(3)\n").expect("script");

        let out = PlatformScriptRunner
            .run(&script, &[], dir.path(), Duration::from_secs(10))
            .expect("run script");
        assert_eq!(out.status, Some(3));
    }
}
