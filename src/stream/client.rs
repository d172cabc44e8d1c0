//! Caller side of the streaming commands.
//!
//! Spawns the bridge binary, waits (bounded) for the header line and hands
//! back the header plus a reader positioned at the first body byte. Failures
//! are classified the same way an embedding web process would present them:
//! nothing on stdout is "failed before header", an unparsable first line is a
//! header parse failure, and no line within the bound is a timeout.

use crate::config::BookFormat;
use crate::error::{AppError, Result};
use crate::stream::StreamHeader;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// Environment variable overriding the binary location.
pub const BINARY_ENV: &str = "EBOOK_BRIDGE_BIN";

/// A started stream: header already read, body pending.
pub struct BridgeStream {
    /// Parsed header.
    pub header: StreamHeader,
    /// Body reader.
    pub body: BufReader<ChildStdout>,
    child: Child,
}

impl BridgeStream {
    /// Read the remaining body into memory and reap the process.
    pub async fn read_body(mut self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.header.content_length as usize);
        self.body.read_to_end(&mut body).await?;
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(AppError::Io(std::io::Error::other(format!(
                "stream process exited with {} after header",
                status
            ))));
        }
        Ok(body)
    }
}

/// Spawns streaming commands.
#[derive(Debug, Clone)]
pub struct StreamClient {
    program: PathBuf,
    prefix_args: Vec<String>,
    timeout: Duration,
}

impl StreamClient {
    /// Client for an explicit program.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            timeout,
        }
    }

    /// Client for `EBOOK_BRIDGE_BIN`, falling back to the running executable.
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let program = program_path(std::env::var_os(BINARY_ENV))?;
        Ok(Self::new(program, timeout))
    }

    /// Arguments inserted before the command (e.g. `--config <path>`).
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    /// Start an object-storage stream.
    pub async fn open_s3(&self, key: &str, range: Option<&str>) -> Result<BridgeStream> {
        let mut args = vec!["s3-stream".to_string(), "--key".to_string(), key.to_string()];
        if let Some(range) = range {
            args.extend(["--range".to_string(), range.to_string()]);
        }
        self.open(args).await
    }

    /// Start a local file stream.
    pub async fn open_local(
        &self,
        path: &Path,
        format: BookFormat,
        range: Option<&str>,
    ) -> Result<BridgeStream> {
        let mut args = vec![
            "serve-file".to_string(),
            "--path".to_string(),
            path.to_string_lossy().into_owned(),
            "--file-type".to_string(),
            format.as_str().to_string(),
        ];
        if let Some(range) = range {
            args.extend(["--range".to_string(), range.to_string()]);
        }
        self.open(args).await
    }

    async fn open(&self, args: Vec<String>) -> Result<BridgeStream> {
        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::StreamFailed(format!(
                    "Failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("child stdout not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();

        let read = tokio::time::timeout(self.timeout, reader.read_until(b'\n', &mut line)).await;
        let read = match read {
            Ok(read) => read?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(AppError::Timeout(self.timeout));
            }
        };

        if read == 0 {
            let stderr = collect_stderr(&mut child).await;
            let _ = child.wait().await;
            return Err(failure_from_stderr(&stderr, self.timeout));
        }

        match StreamHeader::parse_line(&line) {
            Ok(header) => Ok(BridgeStream {
                header,
                body: reader,
                child,
            }),
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

/// Binary to spawn: the override when set and non-empty, else the running executable.
fn program_path(override_path: Option<OsString>) -> Result<PathBuf> {
    match override_path {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(std::env::current_exe()?),
    }
}

async fn collect_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut text).await;
    }
    text
}

/// Map the `error[<kind>]: <message>` diagnostic of a failed run to an error.
/// Anything unrecognised counts as a failure before the header.
pub fn failure_from_stderr(stderr: &str, timeout: Duration) -> AppError {
    let line = stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("error["))
        .unwrap_or_else(|| stderr.trim());

    let parsed = line
        .strip_prefix("error[")
        .and_then(|rest| rest.split_once("]:"))
        .map(|(kind, message)| (kind, message.trim().to_string()));

    match parsed {
        Some(("not_found", message)) => AppError::NotFound(message),
        Some(("config", message)) => AppError::Config(message),
        Some(("timeout", _)) => AppError::Timeout(timeout),
        Some((_, message)) => AppError::StreamFailed(message),
        None if line.is_empty() => {
            AppError::StreamFailed("process exited without output".to_string())
        }
        None => AppError::StreamFailed(line.to_string()),
    }
}
