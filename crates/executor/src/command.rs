use std::collections::BTreeMap;
use std::path::PathBuf;

use convoy_core::{CoreError, CoreResult};

/// An external invocation built from an explicit argument list. There is no
/// shell in the path: the program and each argument are passed through
/// verbatim, which keeps execution deterministic and injection-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput(
                "command program path must not be empty".to_string(),
            ));
        }
        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(CoreError::InvalidInput(
                "command args must not contain NUL bytes".to_string(),
            ));
        }
        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(CoreError::InvalidInput(
                "environment keys must be non-empty and free of NUL bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Human-readable single-line form for diagnostics. Quoting is for display
    /// only; it is never handed to a shell.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

fn shell_quote(text: &str) -> String {
    if text.is_empty() {
        return "''".to_string();
    }
    let simple = text.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | '+')
    });
    if simple {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', "'\\''"))
    }
}
