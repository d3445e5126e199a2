//! Subprocess LLM provider with an argv template.
//!
//! `{{prompt}}` and `{{model}}` placeholders in the configured args are
//! substituted at call time; an empty args list falls back to the default
//! `-p <prompt> -m <model> -o text` argv.

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub struct CommandClient {
    bin_path: String,
    args: Vec<String>,
}

impl CommandClient {
    pub fn new(bin_path: String, args: Vec<String>) -> Self {
        Self { bin_path, args }
    }

    pub async fn generate(&self, model: &str, prompt: &str, timeout: Duration) -> Result<String> {
        let argv = build_argv(&self.args, model, prompt);

        let mut cmd = Command::new(&self.bin_path);
        cmd.args(&argv);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", self.bin_path))?;
        let pid = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.context("command execution failed")?,
            Err(_) => {
                kill_group(pid);
                bail!("timeout reached ({timeout:?}): process group killed");
            }
        };

        if !output.status.success() {
            bail!(
                "command execution failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn build_argv(args: &[String], model: &str, prompt: &str) -> Vec<String> {
    if args.is_empty() {
        return vec![
            "-p".to_string(),
            prompt.to_string(),
            "-m".to_string(),
            model.to_string(),
            "-o".to_string(),
            "text".to_string(),
        ];
    }
    args.iter()
        .map(|arg| arg.replace("{{prompt}}", prompt).replace("{{model}}", model))
        .collect()
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_argv() {
        let argv = build_argv(&[], "gemini-2.0-flash", "do the thing");
        assert_eq!(
            argv,
            ["-p", "do the thing", "-m", "gemini-2.0-flash", "-o", "text"]
        );
    }

    #[test]
    fn test_placeholder_substitution() {
        let args = vec![
            "chat".to_string(),
            "--model={{model}}".to_string(),
            "{{prompt}}".to_string(),
        ];
        let argv = build_argv(&args, "m1", "hello");
        assert_eq!(argv, ["chat", "--model=m1", "hello"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_via_echo() {
        let client = CommandClient::new("echo".to_string(), vec!["{{prompt}}".to_string()]);
        let out = client
            .generate("unused", "hello from the probe", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello from the probe");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let client = CommandClient::new("false".to_string(), vec![]);
        let err = client
            .generate("m", "p", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("command execution failed"));
    }
}
