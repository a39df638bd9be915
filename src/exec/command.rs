// src/exec/command.rs

//! Shell-command work functions.
//!
//! Used by the binary to turn `cmd = "..."` entries into step and tier
//! work. The command runs through the platform shell; stdout of a
//! successful run (trimmed) becomes the JSON string result, stderr is
//! logged at debug. Dropping the future kills the child process.
//!
//! Environment handed to the command:
//! - `TIERFLOW_STEP`, `TIERFLOW_ATTEMPT`
//! - `TIERFLOW_INPUT`: run input as JSON
//! - `TIERFLOW_RESULT_<STEP>`: result of every earlier step
//! - `TIERFLOW_TIER`, `TIERFLOW_PREVIOUS_ERRORS`: tier commands only

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::step::StepContext;
use crate::tier::cascade::{TierContext, TierHandler};
use crate::types::StepId;
use crate::workflow::{Step, StepConfig};

/// Run `cmd` through the shell with extra environment variables.
pub async fn run_shell(label: &str, cmd: &str, env: &[(String, String)]) -> Result<Value> {
    info!(label = %label, cmd = %cmd, "starting command");

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning process for '{label}'"))?;

    // Always consume stderr so buffers don't fill; log at debug.
    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(label = %label, "stderr: {}", line);
            }
        });
    }

    let mut stdout = child
        .stdout
        .take()
        .with_context(|| format!("capturing stdout of '{label}'"))?;
    let read_stdout = async {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await.map(|_| buf)
    };

    let (status, output) = tokio::try_join!(child.wait(), read_stdout)
        .with_context(|| format!("waiting for process of '{label}'"))?;

    let code = status.code().unwrap_or(-1);
    info!(label = %label, exit_code = code, success = status.success(), "command exited");

    if !status.success() {
        bail!("command '{cmd}' exited with code {code}");
    }

    Ok(Value::String(output.trim().to_string()))
}

/// Step that runs `cmd` with the step context exported to its environment.
pub fn shell_step(id: impl Into<StepId>, cmd: impl Into<String>, config: StepConfig) -> Step {
    let cmd: Arc<str> = Arc::from(cmd.into());
    Step::with_config(id, config, move |ctx: StepContext| {
        let cmd = cmd.clone();
        async move {
            let mut env = vec![
                ("TIERFLOW_STEP".to_string(), ctx.step_id().to_string()),
                ("TIERFLOW_ATTEMPT".to_string(), ctx.attempt().to_string()),
                ("TIERFLOW_INPUT".to_string(), ctx.input().to_string()),
            ];
            env.extend(
                ctx.results()
                    .iter()
                    .map(|(step, value)| (result_var(step), value_to_env(value))),
            );
            run_shell(ctx.step_id(), &cmd, &env).await
        }
    })
}

/// Tier handler running `cmd`.
///
/// Expects the cascade input shaped like [`StepContext::to_value`]; other
/// inputs are passed through as `TIERFLOW_INPUT` only.
#[derive(Debug, Clone)]
pub struct ShellTierHandler {
    label: String,
    cmd: Arc<str>,
}

impl ShellTierHandler {
    pub fn new(label: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cmd: Arc::from(cmd.into()),
        }
    }
}

impl TierHandler for ShellTierHandler {
    fn handle(&self, ctx: TierContext) -> crate::exec::BoxFuture<'static, Result<Value>> {
        let label = format!("{}/{}", self.label, ctx.tier);
        let cmd = self.cmd.clone();
        Box::pin(async move {
            let previous = ctx
                .previous_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n");

            let (input, results) = match ctx.input.as_ref() {
                Value::Object(map) if map.contains_key("results") => (
                    map.get("input").cloned().unwrap_or(Value::Null),
                    map.get("results").and_then(Value::as_object).cloned(),
                ),
                other => (other.clone(), None),
            };

            let mut env = vec![
                ("TIERFLOW_STEP".to_string(), label.clone()),
                ("TIERFLOW_TIER".to_string(), ctx.tier.to_string()),
                ("TIERFLOW_ATTEMPT".to_string(), ctx.attempt.to_string()),
                ("TIERFLOW_INPUT".to_string(), input.to_string()),
                ("TIERFLOW_PREVIOUS_ERRORS".to_string(), previous),
            ];
            if let Some(results) = results {
                env.extend(
                    results
                        .iter()
                        .map(|(step, value)| (result_var(step), value_to_env(value))),
                );
            }

            run_shell(&label, &cmd, &env).await
        })
    }
}

/// `TIERFLOW_RESULT_<STEP>` with the step id upper-cased and every
/// non-alphanumeric character replaced by `_`.
pub fn result_var(step: &str) -> String {
    let suffix: String = step
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TIERFLOW_RESULT_{suffix}")
}

/// Strings verbatim, everything else as JSON.
fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
