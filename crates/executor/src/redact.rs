use std::sync::OnceLock;

use regex::Regex;

fn home_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:/Users|/home)/[A-Za-z0-9._-]+").expect("static regex compiles")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex compiles")
    })
}

fn credential_assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(token|secret|password|passwd|api[_-]?key|authorization|bearer)\b\s*[=:]?\s*\S+")
            .expect("static regex compiles")
    })
}

fn token_blob_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z0-9+/]{40,}={0,2}\b").expect("static regex compiles"))
}

/// Scrubs user-identifying paths and credential-shaped strings from diagnostic
/// text before it is persisted or surfaced. Applied to captured commands,
/// stdout/stderr tails, and error messages.
pub fn redact(text: &str) -> String {
    let step = home_path_re().replace_all(text, "~");
    let step = email_re().replace_all(&step, "[redacted-email]");
    let step = credential_assignment_re().replace_all(&step, "$1=[redacted]");
    token_blob_re()
        .replace_all(&step, "[redacted-token]")
        .into_owned()
}

pub fn redact_opt(text: Option<String>) -> Option<String> {
    text.map(|value| redact(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_home_directories() {
        assert_eq!(
            redact("/Users/alex/.cargo/bin/cargo install ripgrep"),
            "~/.cargo/bin/cargo install ripgrep"
        );
        assert_eq!(redact("/home/alex/.npmrc"), "~/.npmrc");
    }

    #[test]
    fn masks_emails_and_credentials() {
        let scrubbed = redact("login dev@example.com token=abc123def");
        assert!(!scrubbed.contains("dev@example.com"));
        assert!(!scrubbed.contains("abc123def"));
    }

    #[test]
    fn masks_long_base64_blobs() {
        let scrubbed = redact("auth AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHHIIIIJJJJkkkk done");
        assert!(scrubbed.contains("[redacted-token]"));
    }

    #[test]
    fn leaves_ordinary_output_alone() {
        let line = "ripgrep 14.0.3 -> 14.1.0";
        assert_eq!(redact(line), line);
    }
}
