use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Instant};

use trellis_core::sandbox::{CodeSandbox, SandboxErrorKind, SandboxRequest, SandboxResult};

use crate::analyzer::analyze;
use crate::harness::{harness_source, INTERPRETER_FLAGS};
use crate::isolation::{isolate_command, IsolationPolicy};
use crate::SandboxError;

pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// Room for the JSON envelope around captured output
const ENVELOPE_OVERHEAD_BYTES: usize = 64 * 1024;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessSandboxConfig {
    pub python: String,
    pub isolation: IsolationPolicy,
    pub max_output_bytes: usize,
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON.to_string(),
            isolation: IsolationPolicy::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs each code unit in a short-lived interpreter process.
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
    harness: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// How the interpreter process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

struct Captured {
    exit: ExitInfo,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ProcessSandbox {
    pub fn new(config: ProcessSandboxConfig) -> Self {
        Self {
            config,
            harness: harness_source(),
        }
    }

    pub fn config(&self) -> &ProcessSandboxConfig {
        &self.config
    }

    fn command(&self, memory_limit_mb: u64, timeout: Duration) -> Result<Command, SandboxError> {
        let mut args: Vec<String> = INTERPRETER_FLAGS.iter().map(|s| s.to_string()).collect();
        args.push("-c".to_string());
        args.push(self.harness.clone());
        let isolated = isolate_command(self.config.python.clone(), args, &self.config.isolation)?;

        let mut cmd = Command::new(&isolated.program);
        cmd.args(&isolated.args)
            .env_clear()
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut cmd, memory_limit_mb, timeout);
        Ok(cmd)
    }

    async fn spawn_and_wait(
        &self,
        request: &SandboxRequest,
    ) -> Result<Option<Captured>, SandboxError> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "code": request.code,
            "input": request.input,
            "max_output_bytes": self.config.max_output_bytes,
        }))
        .map_err(|e| SandboxError::Protocol(e.to_string()))?;

        let mut child = self
            .command(request.memory_limit_mb, request.timeout)?
            .spawn()
            .map_err(SandboxError::Spawn)?;
        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Protocol("failed to capture stderr".to_string()))?;
        let cap = self.config.max_output_bytes + ENVELOPE_OVERHEAD_BYTES;

        let run = async {
            let write = async move {
                if let Err(error) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %error, "sandbox stdin closed early");
                }
                drop(stdin);
            };
            let (_, stdout, stderr, status) = tokio::join!(
                write,
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            let status = status.map_err(SandboxError::Spawn)?;
            Ok::<_, SandboxError>(Captured {
                exit: exit_info(&status),
                stdout,
                stderr,
            })
        };

        match timeout(request.timeout, run).await {
            Ok(captured) => captured.map(Some),
            Err(_) => {
                kill_process_group(pid);
                Ok(None)
            }
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(ProcessSandboxConfig::default())
    }
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn run(&self, request: SandboxRequest) -> SandboxResult {
        if let Err(violation) = analyze(&request.code) {
            tracing::warn!(violation = %violation, "code unit rejected before execution");
            return SandboxResult::failure(
                SandboxErrorKind::SecurityViolation,
                violation.to_string(),
                0,
            );
        }
        self.execute(request).await
    }

    async fn health_check(&self) -> bool {
        self.check_interpreter().await
    }
}

impl ProcessSandbox {
    /// Spawn the interpreter without the static check.
    pub(crate) async fn execute(&self, request: SandboxRequest) -> SandboxResult {
        let started = Instant::now();
        let outcome = self.spawn_and_wait(&request).await;
        let wall_time_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Some(captured)) => {
                let result = classify(
                    captured.exit,
                    &captured.stdout,
                    &String::from_utf8_lossy(&captured.stderr),
                    wall_time_ms,
                );
                tracing::debug!(
                    wall_time_ms = wall_time_ms,
                    exit_code = ?captured.exit.code,
                    signal = ?captured.exit.signal,
                    error_kind = ?result.error_kind(),
                    "code unit finished"
                );
                result
            }
            Ok(None) => {
                tracing::warn!(
                    timeout_ms = request.timeout.as_millis() as u64,
                    "code unit timed out, process group killed"
                );
                SandboxResult::failure(
                    SandboxErrorKind::Timeout,
                    format!("execution exceeded {:.3}s", request.timeout.as_secs_f64()),
                    wall_time_ms,
                )
            }
            Err(error) => {
                tracing::error!(error = %error, "sandbox failed to run code unit");
                SandboxResult::failure(
                    SandboxErrorKind::RuntimeError,
                    error.to_string(),
                    wall_time_ms,
                )
            }
        }
    }

    async fn check_interpreter(&self) -> bool {
        let mut cmd = Command::new(&self.config.python);
        cmd.args(INTERPRETER_FLAGS)
            .arg("-c")
            .arg("print('ok')")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match timeout(HEALTH_CHECK_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(error)) => {
                tracing::warn!(python = %self.config.python, error = %error, "interpreter unavailable");
                false
            }
            Err(_) => false,
        }
    }
}

/// Read everything from `reader`, keeping at most `cap` bytes so the child
/// never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

pub(crate) fn classify(exit: ExitInfo, stdout: &[u8], stderr: &str, wall_time_ms: u64) -> SandboxResult {
    let process_stderr = stderr.trim_end().to_string();
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(stdout) {
        let combined_stderr = if process_stderr.is_empty() {
            envelope.stderr
        } else {
            format!("{}{}", envelope.stderr, process_stderr)
        };
        if envelope.ok {
            return SandboxResult::success(
                envelope.result,
                envelope.stdout,
                combined_stderr,
                wall_time_ms,
            );
        }
        let error_type = envelope.error_type.unwrap_or_else(|| "Error".to_string());
        let kind = if error_type == "MemoryError" {
            SandboxErrorKind::MemoryExceeded
        } else {
            SandboxErrorKind::RuntimeError
        };
        let message = if envelope.message.is_empty() {
            error_type
        } else {
            format!("{}: {}", error_type, envelope.message)
        };
        return SandboxResult::failure(kind, message, wall_time_ms)
            .with_output(envelope.stdout, combined_stderr);
    }

    let (kind, message) = match exit.signal {
        Some(signal) if is_cpu_limit_signal(signal) => (
            SandboxErrorKind::Timeout,
            "cpu time limit exceeded".to_string(),
        ),
        Some(signal) if is_memory_signal(signal) => (
            SandboxErrorKind::MemoryExceeded,
            format!("interpreter killed by signal {}", signal),
        ),
        _ if process_stderr.contains("MemoryError") => (
            SandboxErrorKind::MemoryExceeded,
            "memory limit exceeded".to_string(),
        ),
        Some(signal) => (
            SandboxErrorKind::RuntimeError,
            format!("interpreter killed by signal {}", signal),
        ),
        None => (
            SandboxErrorKind::RuntimeError,
            format!(
                "interpreter exited with status {} without a result",
                exit.code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
            ),
        ),
    };
    SandboxResult::failure(kind, message, wall_time_ms)
        .with_output(String::from_utf8_lossy(stdout).to_string(), process_stderr)
}

#[cfg(unix)]
fn exit_info(status: &std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: &std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[cfg(unix)]
fn is_cpu_limit_signal(signal: i32) -> bool {
    signal == libc::SIGXCPU
}

#[cfg(not(unix))]
fn is_cpu_limit_signal(_signal: i32) -> bool {
    false
}

#[cfg(unix)]
fn is_memory_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGKILL | libc::SIGSEGV | libc::SIGABRT | libc::SIGBUS)
}

#[cfg(not(unix))]
fn is_memory_signal(_signal: i32) -> bool {
    false
}

/// New session so the whole group can be killed; address-space and CPU
/// ceilings from the request.
#[cfg(unix)]
fn apply_limits(cmd: &mut Command, memory_limit_mb: u64, timeout: Duration) {
    let memory_bytes = memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_seconds = timeout.as_secs().saturating_add(1);
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if memory_bytes > 0 {
                let rlimit = libc::rlimit {
                    rlim_cur: memory_bytes as libc::rlim_t,
                    rlim_max: memory_bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            let rlimit = libc::rlimit {
                rlim_cur: cpu_seconds as libc::rlim_t,
                rlim_max: cpu_seconds.saturating_add(1) as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_cmd: &mut Command, _memory_limit_mb: u64, _timeout: Duration) {
    tracing::warn!("resource limits are not enforced on this platform");
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // setsid made the child its own group leader
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn python_available() -> bool {
        std::process::Command::new(DEFAULT_PYTHON)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn exited(code: i32) -> ExitInfo {
        ExitInfo {
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn test_classify_success_envelope() {
        let stdout = br#"{"ok": true, "result": {"n": 2}, "stdout": "hi\n", "stderr": ""}"#;
        let result = classify(exited(0), stdout, "", 5);
        assert!(result.is_success());
        assert_eq!(result.return_value, json!({"n": 2}));
        assert_eq!(result.stdout, "hi\n");
    }

    #[test]
    fn test_classify_error_envelopes() {
        let stdout = br#"{"ok": false, "error_type": "MemoryError", "message": "memory limit exceeded"}"#;
        assert_eq!(
            classify(exited(0), stdout, "", 1).error_kind(),
            Some(SandboxErrorKind::MemoryExceeded)
        );
        let stdout = br#"{"ok": false, "error_type": "ZeroDivisionError", "message": "division by zero"}"#;
        let result = classify(exited(0), stdout, "", 1);
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::RuntimeError));
        assert!(result
            .error
            .as_ref()
            .map(|e| e.message.contains("ZeroDivisionError"))
            .unwrap_or(false));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_missing_envelope_by_signal() {
        let killed = ExitInfo {
            code: None,
            signal: Some(libc::SIGKILL),
        };
        assert_eq!(
            classify(killed, b"", "", 1).error_kind(),
            Some(SandboxErrorKind::MemoryExceeded)
        );
        let cpu = ExitInfo {
            code: None,
            signal: Some(libc::SIGXCPU),
        };
        assert_eq!(
            classify(cpu, b"", "", 1).error_kind(),
            Some(SandboxErrorKind::Timeout)
        );
        assert_eq!(
            classify(exited(1), b"", "SyntaxError", 1).error_kind(),
            Some(SandboxErrorKind::RuntimeError)
        );
    }

    #[tokio::test]
    async fn test_security_violation_never_spawns() {
        let sandbox = ProcessSandbox::new(ProcessSandboxConfig {
            python: "/nonexistent/python".to_string(),
            ..ProcessSandboxConfig::default()
        });
        let result = sandbox
            .run(SandboxRequest::new("import os\nresult = os.getcwd()", json!({})))
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::SecurityViolation));
    }

    fn frame_walk_code(marker: &std::path::Path) -> String {
        format!(
            "def g():\n    yield gen.gi_frame.f_back.f_back\n\
             gen = g()\n\
             fr = list(gen)[0]\n\
             fr.f_builtins['__import__']('subprocess').run(['touch', {:?}])\n\
             result = 'escaped'\n",
            marker.display().to_string()
        )
    }

    #[tokio::test]
    async fn test_frame_walk_is_rejected_before_spawn() {
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("escaped");
        let result = ProcessSandbox::default()
            .run(SandboxRequest::new(frame_walk_code(&marker), json!({})))
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::SecurityViolation));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_harness_frames_expose_no_real_builtins() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let marker = dir.path().join("escaped");
        let sandbox = ProcessSandbox::default();

        let result = sandbox
            .execute(SandboxRequest::new(frame_walk_code(&marker), json!({})))
            .await;
        assert!(!result.is_success(), "unit escaped: {:?}", result.return_value);
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::RuntimeError));
        assert!(!marker.exists());

        let leaked_modules = "def g():\n    yield gen.gi_frame.f_back.f_back\n\
                             gen = g()\n\
                             fr = list(gen)[0]\n\
                             result = sorted(k for k in ('os', 'sys', 'json', 'io', 'builtins') \
                             if k in fr.f_globals)\n";
        let result = sandbox
            .execute(SandboxRequest::new(leaked_modules, json!({})))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.return_value, json!([]));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_runtime_error() {
        let sandbox = ProcessSandbox::new(ProcessSandboxConfig {
            python: "/nonexistent/python".to_string(),
            ..ProcessSandboxConfig::default()
        });
        assert!(!sandbox.health_check().await);
        let result = sandbox.run(SandboxRequest::new("result = 1", json!({}))).await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::RuntimeError));
    }

    #[tokio::test]
    async fn test_runs_code_with_input() {
        if !python_available() {
            return;
        }
        let sandbox = ProcessSandbox::default();
        assert!(sandbox.health_check().await);
        let result = sandbox
            .run(SandboxRequest::new(
                "print('summing')\nresult = {'total': sum(input['values'])}",
                json!({"values": [1, 2, 3]}),
            ))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.return_value, json!({"total": 6}));
        assert_eq!(result.stdout, "summing\n");
    }

    #[tokio::test]
    async fn test_restricted_builtins_hide_open() {
        if !python_available() {
            return;
        }
        // `open` is caught by the analyzer; reach for a name the analyzer allows
        // but the namespace does not provide.
        let result = ProcessSandbox::default()
            .run(SandboxRequest::new("result = hex(255)", json!({})))
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::RuntimeError));
        assert!(result
            .error
            .as_ref()
            .map(|e| e.message.contains("NameError"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        if !python_available() {
            return;
        }
        let started = std::time::Instant::now();
        let result = ProcessSandbox::default()
            .run(
                SandboxRequest::new("while True:\n    pass", json!({}))
                    .with_timeout(Duration::from_millis(500)),
            )
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_ceiling() {
        if !python_available() {
            return;
        }
        let result = ProcessSandbox::default()
            .run(
                SandboxRequest::new("data = 'x' * (1024 * 1024 * 1024)\nresult = len(data)", json!({}))
                    .with_memory_limit_mb(128),
            )
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::MemoryExceeded));
    }

    #[tokio::test]
    async fn test_unserializable_result_is_runtime_error() {
        if !python_available() {
            return;
        }
        let result = ProcessSandbox::default()
            .run(SandboxRequest::new("result = {1, 2}", json!({})))
            .await;
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::RuntimeError));
    }
}
