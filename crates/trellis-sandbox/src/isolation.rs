use std::path::PathBuf;

use crate::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Plain child process (rlimits and process group only)
    #[default]
    None,
    /// Wrap the interpreter in Linux bubblewrap
    Bubblewrap,
}

impl IsolationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "process" => Some(Self::None),
            "bubblewrap" | "bwrap" | "linux_bwrap" => Some(Self::Bubblewrap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bubblewrap => "bubblewrap",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    pub mode: IsolationMode,
    pub allow_network: bool,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub bwrap_path: Option<PathBuf>,
}

/// Program and arguments to spawn for one code unit
#[derive(Debug, Clone)]
pub struct IsolatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub backend: &'static str,
}

pub fn isolate_command(
    program: String,
    args: Vec<String>,
    policy: &IsolationPolicy,
) -> Result<IsolatedCommand, SandboxError> {
    match policy.mode {
        IsolationMode::None => Ok(IsolatedCommand {
            program,
            args,
            backend: "none",
        }),
        IsolationMode::Bubblewrap => wrap_with_bwrap(program, args, policy),
    }
}

#[cfg(target_os = "linux")]
fn wrap_with_bwrap(
    program: String,
    args: Vec<String>,
    policy: &IsolationPolicy,
) -> Result<IsolatedCommand, SandboxError> {
    let bwrap = resolve_bwrap_executable(policy)?;
    let mut wrapped = build_bwrap_args(policy);
    wrapped.push("--".to_string());
    wrapped.push(program);
    wrapped.extend(args);
    Ok(IsolatedCommand {
        program: bwrap.to_string_lossy().to_string(),
        args: wrapped,
        backend: "linux_bwrap",
    })
}

#[cfg(not(target_os = "linux"))]
fn wrap_with_bwrap(
    _program: String,
    _args: Vec<String>,
    _policy: &IsolationPolicy,
) -> Result<IsolatedCommand, SandboxError> {
    Err(SandboxError::Isolation(
        "bubblewrap isolation is only available on Linux".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn resolve_bwrap_executable(policy: &IsolationPolicy) -> Result<PathBuf, SandboxError> {
    if let Some(path) = &policy.bwrap_path {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(SandboxError::Isolation(format!(
            "configured bwrap_path does not exist: {}",
            path.to_string_lossy()
        )));
    }

    for candidate in ["bwrap", "bubblewrap"] {
        if let Some(path) = find_executable_in_path(candidate) {
            return Ok(path);
        }
    }
    Err(SandboxError::Isolation(
        "bubblewrap executable not found (tried bwrap/bubblewrap in PATH); set sandbox.bwrap_path"
            .to_string(),
    ))
}

pub(crate) fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for base in std::env::split_paths(&path_var) {
        let candidate = base.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn build_bwrap_args(policy: &IsolationPolicy) -> Vec<String> {
    let mut args = vec![
        "--die-with-parent".to_string(),
        "--new-session".to_string(),
        "--proc".to_string(),
        "/proc".to_string(),
        "--dev".to_string(),
        "/dev".to_string(),
        "--ro-bind".to_string(),
        "/".to_string(),
        "/".to_string(),
        "--tmpfs".to_string(),
        "/tmp".to_string(),
        "--tmpfs".to_string(),
        "/var/tmp".to_string(),
        "--unshare-pid".to_string(),
        "--unshare-ipc".to_string(),
    ];
    if !policy.allow_network {
        args.push("--unshare-net".to_string());
    }
    args.push("--chdir".to_string());
    args.push("/tmp".to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_isolation_mode() {
        assert_eq!(IsolationMode::parse("bwrap"), Some(IsolationMode::Bubblewrap));
        assert_eq!(IsolationMode::parse(" None "), Some(IsolationMode::None));
        assert_eq!(IsolationMode::parse("seatbelt"), None);
    }

    #[test]
    fn test_none_mode_passthrough_command() {
        let output = isolate_command(
            "python3".to_string(),
            vec!["-I".to_string()],
            &IsolationPolicy::default(),
        )
        .expect("isolated command");
        assert_eq!(output.program, "python3");
        assert_eq!(output.args, vec!["-I".to_string()]);
        assert_eq!(output.backend, "none");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bwrap_args_disable_network_by_default() {
        let args = build_bwrap_args(&IsolationPolicy::default());
        assert!(args.iter().any(|v| v == "--unshare-net"));
        assert!(args.iter().any(|v| v == "--die-with-parent"));

        let networked = IsolationPolicy {
            allow_network: true,
            ..IsolationPolicy::default()
        };
        assert!(!build_bwrap_args(&networked).iter().any(|v| v == "--unshare-net"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_configured_bwrap_is_an_error() {
        let policy = IsolationPolicy {
            mode: IsolationMode::Bubblewrap,
            allow_network: false,
            bwrap_path: Some(PathBuf::from("/nonexistent/bwrap")),
        };
        let err = isolate_command("python3".to_string(), Vec::new(), &policy).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
