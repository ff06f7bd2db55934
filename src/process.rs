//! Process-based sandbox host
//!
//! Each run spawns a fresh interpreter process in its own process group. The
//! script never shares memory with the caller and gets an empty environment
//! apart from `PATH`.
//!
//! A run has two phases. `prepare` spawns the interpreter and waits until it
//! prints [`READY_MARKER`], so interpreter startup is never part of the
//! execution time. `execute` then writes the script to the interpreter's stdin
//! and collects its output under the per-call deadline. When the interpreter
//! exits or the deadline passes, the whole process group is killed, so nothing
//! the script started in the background survives the run.

use crate::{PreparedScript, SandboxError, SandboxHost, SandboxRunRequest};
use serde_json::Value as JsonValue;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

macro_rules! ready_marker {
    () => {
        "__sandbox_ready__"
    };
}

/// Line an interpreter prints once its sandbox is built and it is waiting for code
pub const READY_MARKER: &str = ready_marker!();
/// Environment variable carrying the bindings as a JSON object
pub const BINDINGS_ENV: &str = "SANDBOX_BINDINGS";

/// Builds a V8 context whose globals are the bindings (null bindings stay
/// undefined), announces it is ready, then evaluates stdin in that context and
/// prints the completion value as JSON.
const NODE_RUNNER: &str = concat!(
    r#"
const fs = require("fs");
const vm = require("vm");
const bindings = JSON.parse(process.env.SANDBOX_BINDINGS || "{}");
const sandbox = {};
for (const [name, value] of Object.entries(bindings)) {
  sandbox[name] = value === null ? undefined : value;
}
const context = vm.createContext(sandbox);
process.stdout.write(""#,
    ready_marker!(),
    r#"\n");
const code = fs.readFileSync(0, "utf8");
try {
  const json = JSON.stringify(vm.runInContext(code, context));
  process.stdout.write(json === undefined ? "null" : json);
} catch (err) {
  process.stderr.write(String(err));
  process.exitCode = 1;
}
"#
);

/// Reads the whole of stdin and evaluates it; stdout is the result
const SHELL_RUNNER: &str = concat!("echo ", ready_marker!(), "; eval \"$(cat)\"");

/// Runs scripts as child processes
#[derive(Debug, Clone)]
pub struct ProcessHost {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ProcessHost {
    /// Run scripts with `program args...`
    ///
    /// The program must print [`READY_MARKER`] on its own line once it can
    /// accept code, then read the script from stdin until EOF. Bindings are in
    /// [`BINDINGS_ENV`].
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
        }
    }

    /// JavaScript through Node's `vm` module
    pub fn node() -> Self {
        Self::new("node", vec!["-e".to_string(), NODE_RUNNER.to_string()])
    }

    /// POSIX shell; stdout is the result
    pub fn shell() -> Self {
        Self::new("sh", vec!["-c".to_string(), SHELL_RUNNER.to_string()])
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn command(&self, request: &SandboxRunRequest) -> Result<Command, SandboxError> {
        let bindings = serde_json::to_string(&request.bindings)
            .map_err(|e| SandboxError::RuntimeFault(format!("Invalid bindings: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .env(BINDINGS_ENV, bindings)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        Ok(cmd)
    }
}

impl SandboxHost for ProcessHost {
    type Prepared = PreparedProcess;

    async fn prepare(&self, request: SandboxRunRequest) -> Result<PreparedProcess, SandboxError> {
        let mut child = self.command(&request)?.spawn().map_err(|e| {
            SandboxError::RuntimeFault(format!("Failed to spawn {}: {}", self.program, e))
        })?;
        let group = ProcessGroup::of(&child);

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SandboxError::RuntimeFault(format!(
                "{} started without piped stdio",
                self.name
            )));
        };

        let mut prepared = PreparedProcess {
            name: self.name.clone(),
            request,
            child,
            group,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
        };

        // Dropping `prepared` on any failure kills the interpreter
        let ready = tokio::time::timeout(prepared.request.timeout, prepared.wait_ready()).await;
        match ready {
            Ok(Ok(())) => Ok(prepared),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(prepared.request.timed_out()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An interpreter process waiting for its script
#[derive(Debug)]
pub struct PreparedProcess {
    name: String,
    request: SandboxRunRequest,
    child: Child,
    group: ProcessGroup,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: ChildStderr,
}

impl PreparedProcess {
    async fn wait_ready(&mut self) -> Result<(), SandboxError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await.map_err(|e| {
            SandboxError::RuntimeFault(format!("Failed to read from {}: {}", self.name, e))
        })?;

        if line.trim_end() == READY_MARKER {
            return Ok(());
        }
        if read > 0 {
            return Err(SandboxError::RuntimeFault(format!(
                "{} printed {:?} before it was ready",
                self.name,
                line.trim_end()
            )));
        }

        let mut stderr = Vec::new();
        let _ = self.stderr.read_to_end(&mut stderr).await;
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        tracing::debug!(host = %self.name, %stderr, "Interpreter exited during setup");

        Err(SandboxError::RuntimeFault(if stderr.is_empty() {
            format!("{} exited before it was ready", self.name)
        } else {
            stderr
        }))
    }
}

impl PreparedScript for PreparedProcess {
    async fn execute(self) -> Result<JsonValue, SandboxError> {
        let Self {
            name,
            request,
            mut child,
            mut group,
            mut stdin,
            mut stdout,
            mut stderr,
        } = self;
        let timed_out = request.timed_out();
        let code = request.code;

        let mut out = Vec::new();
        let mut err = Vec::new();

        let script = async move {
            if let Err(e) = stdin.write_all(code.as_bytes()).await {
                tracing::debug!(host = %name, error = %e, "Interpreter closed stdin early");
            }
            drop(stdin);

            let status = child.wait().await;
            // Background jobs keep the pipes open; they end with the script
            group.kill();
            status
        };

        // On timeout the dropped future takes the child and its group down
        let finished = tokio::time::timeout(request.timeout, async {
            let (status, out_read, err_read) = tokio::join!(
                script,
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
            );
            out_read.and(err_read).and(status)
        })
        .await;

        let status = match finished {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(SandboxError::RuntimeFault(format!("Process I/O error: {}", e)));
            }
            Err(_) => return Err(timed_out),
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&err).trim().to_string();
            tracing::debug!(%status, %stderr, "Script process failed");

            let message = if stderr.is_empty() {
                format!("Script exited with {}", status)
            } else {
                stderr
            };
            return Err(SandboxError::RuntimeFault(message));
        }

        Ok(parse_output(&out))
    }
}

/// Kills every process in a child's group, once, at the latest when dropped
#[derive(Debug)]
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    /// The group led by `child`, which must have been spawned with `process_group(0)`
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.leader.take() else {
            return;
        };

        #[cfg(unix)]
        // SAFETY: killpg only sends a signal; an already empty group yields ESRCH
        unsafe {
            libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// JSON when stdout is JSON, otherwise the trimmed text; empty output is null
fn parse_output(stdout: &[u8]) -> JsonValue {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}
