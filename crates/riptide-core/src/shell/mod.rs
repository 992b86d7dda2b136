//! Shell provider: maps a shell name to its invocation pattern.

use crate::error::EngineError;

/// Shell names the provider knows how to invoke.
pub const SUPPORTED_SHELLS: &[&str] = &["bash", "sh", "zsh", "pwsh", "powershell", "cmd"];

/// The platform default shell: `cmd` on Windows, `bash` elsewhere.
pub fn default_shell() -> &'static str {
    if cfg!(windows) { "cmd" } else { "bash" }
}

/// A concrete child-process invocation for a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub executable: String,
    pub args: Vec<String>,
}

/// Build the invocation for a named shell.
pub fn build_invocation(shell: &str, command: &str) -> Result<ShellInvocation, EngineError> {
    let args = match shell {
        "bash" | "sh" | "zsh" => vec!["-c".to_string(), command.to_string()],
        "pwsh" | "powershell" => vec![
            "-NoProfile".to_string(),
            "-Command".to_string(),
            command.to_string(),
        ],
        "cmd" => vec!["/C".to_string(), command.to_string()],
        other => {
            return Err(EngineError::UnsupportedShell {
                name: other.to_string(),
                supported: SUPPORTED_SHELLS.join(", "),
            });
        }
    };
    Ok(ShellInvocation {
        executable: shell.to_string(),
        args,
    })
}

/// Build an invocation for the requested shell, falling back to the
/// platform default when none is requested.
pub fn invocation_for(requested: Option<&str>, command: &str) -> Result<ShellInvocation, EngineError> {
    build_invocation(requested.unwrap_or_else(|| default_shell()), command)
}

/// Quote a string for safe embedding in a POSIX single-quoted context
/// (used when a command is relayed through a remote shell).
pub fn posix_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
