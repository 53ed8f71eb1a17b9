use std::process::Stdio;
use std::time::Duration;

use deskmate_llm::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1000 * 1000;
const OSASCRIPT_BINARY: &str = "/usr/bin/osascript";

/// Which host program receives the script on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interpreter {
    Shell,
    /// JavaScript for Automation through `osascript`.
    OsScripting,
}

impl Interpreter {
    fn command(self) -> Command {
        match self {
            Self::Shell => {
                let mut command = Command::new("sh");
                command.arg("-s");
                command
            }
            Self::OsScripting => {
                let mut command = Command::new(OSASCRIPT_BINARY);
                command.args(["-l", "JavaScript"]);
                command
            }
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::OsScripting => OSASCRIPT_BINARY,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ScriptError {
    #[snafu(display("failed to start `{program}` on `{stage}`: {source}"))]
    Spawn {
        stage: &'static str,
        program: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("script process io failed on `{stage}`: {source}"))]
    ProcessIo {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("script did not finish within {timeout_ms}ms"))]
    TimedOut { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("script output exceeded {limit_bytes} bytes"))]
    OutputTooLarge {
        stage: &'static str,
        limit_bytes: usize,
    },
    #[snafu(display("script exited with code {exit_code:?}: {stderr}"))]
    NonZeroExit {
        stage: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[snafu(display("script reported an error: {stderr}"))]
    ErrorOutput { stage: &'static str, stderr: String },
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Opaque "run script, get text or fail" boundary.
pub trait ScriptExecutor: Send + Sync {
    fn execute<'a>(&'a self, script: &'a str) -> BoxFuture<'a, ScriptResult<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRunner {
    pub interpreter: Interpreter,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl ScriptRunner {
    pub fn new(interpreter: Interpreter) -> Self {
        Self {
            interpreter,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Feeds `script` to the interpreter and returns trimmed stdout.
    ///
    /// Any stderr output counts as failure even on a zero exit, since `osascript` reports
    /// script-level faults that way. Empty stdout is a successful run.
    pub async fn run(&self, script: &str) -> ScriptResult<String> {
        let mut child = self
            .interpreter
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(SpawnSnafu {
                stage: "spawn-interpreter",
                program: self.interpreter.program(),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.max_output_bytes;

        // The child moves into this future so a timeout drops it, which kills the process.
        let io = async move {
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    stdin
                        .write_all(script.as_bytes())
                        .await
                        .context(ProcessIoSnafu {
                            stage: "write-script-stdin",
                        })?;
                    stdin.shutdown().await.context(ProcessIoSnafu {
                        stage: "close-script-stdin",
                    })?;
                }
                Ok::<(), ScriptError>(())
            };
            let (fed, out, err) = tokio::join!(
                feed,
                read_capped(stdout, limit, "read-stdout"),
                read_capped(stderr, limit, "read-stderr"),
            );
            fed?;
            let (out, err) = (out?, err?);
            let status = child.wait().await.context(ProcessIoSnafu {
                stage: "wait-interpreter",
            })?;
            Ok::<_, ScriptError>((status, out, err))
        };

        let (status, stdout, stderr) = match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    interpreter = ?self.interpreter,
                    timeout_ms = duration_millis(self.timeout),
                    "script timed out; killing interpreter"
                );
                return TimedOutSnafu {
                    stage: "await-interpreter",
                    timeout_ms: duration_millis(self.timeout),
                }
                .fail();
            }
        };

        let wrote_stderr = !stderr.is_empty();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        ensure!(
            status.success(),
            NonZeroExitSnafu {
                stage: "check-exit-status",
                exit_code: status.code(),
                stderr,
            }
        );
        ensure!(
            !wrote_stderr,
            ErrorOutputSnafu {
                stage: "check-stderr",
                stderr,
            }
        );

        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(Interpreter::OsScripting)
    }
}

impl ScriptExecutor for ScriptRunner {
    fn execute<'a>(&'a self, script: &'a str) -> BoxFuture<'a, ScriptResult<String>> {
        Box::pin(self.run(script))
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn read_capped<R>(
    reader: Option<R>,
    limit: usize,
    stage: &'static str,
) -> ScriptResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };

    let mut buffer = Vec::new();
    // One extra byte distinguishes "exactly at the limit" from "over it".
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buffer)
        .await
        .context(ProcessIoSnafu { stage })?;
    ensure!(
        buffer.len() <= limit,
        OutputTooLargeSnafu {
            stage,
            limit_bytes: limit,
        }
    );
    Ok(buffer)
}
