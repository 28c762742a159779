//! Bounded external process execution with captured output.

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Default cap per captured stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script timed out after {0:?}")]
    Timeout(Duration),
    #[error("script output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error("reading script output: {0}")]
    Io(#[from] std::io::Error),
    #[error("script exited with code {exit_code:?}")]
    Exit {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("script returned empty output")]
    EmptyOutput,
    #[error("decoding script output: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ScriptCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl ScriptCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ScriptOutput {
    /// `Exit` error for a non-zero status, carrying the captured streams.
    pub fn exit_error(&self) -> Option<ScriptError> {
        (!self.success).then(|| ScriptError::Exit {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}

async fn read_capped<R>(reader: Option<R>, limit: usize) -> Result<Vec<u8>, ScriptError>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(ScriptError::OutputTooLarge { limit });
    }
    Ok(buf)
}

/// Runs the command to completion. A non-zero exit is not an error here; see
/// [`ScriptOutput::exit_error`]. The child is killed if the timeout fires or the
/// returned future is dropped.
pub async fn run_script(command: &ScriptCommand) -> Result<ScriptOutput, ScriptError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ScriptError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    debug!(program = %command.program, args = ?command.args, "script started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = command.max_output_bytes;

    let run = async {
        let (out, err) = tokio::try_join!(read_capped(stdout, limit), read_capped(stderr, limit))?;
        let status = child.wait().await?;
        Ok::<_, ScriptError>((out, err, status))
    };

    let (out, err, status) = tokio::time::timeout(command.timeout, run)
        .await
        .map_err(|_| ScriptError::Timeout(command.timeout))??;

    Ok(ScriptOutput {
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        exit_code: status.code(),
        success: status.success(),
    })
}

/// Strips a leading byte-order mark and surrounding whitespace.
pub fn clean_output(stdout: &str) -> &str {
    stdout.trim_start_matches('\u{feff}').trim()
}

pub fn decode_json_output<T: DeserializeOwned>(stdout: &str) -> Result<T, ScriptError> {
    let body = clean_output(stdout);
    if body.is_empty() {
        return Err(ScriptError::EmptyOutput);
    }
    Ok(serde_json::from_str(body)?)
}
