//! Gateway token discovery from a locally installed OpenClaw gateway.
//!
//! The gateway keeps its config in `~/.openclaw/openclaw.json` (JSON5). When
//! the client runs on the same host, the token it expects lives at
//! `gateway.auth.token`.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Points at a non-default OpenClaw config file.
pub const OPENCLAW_CONFIG_PATH_ENV: &str = "OPENCLAW_CONFIG_PATH";

/// Default location of the OpenClaw gateway config.
pub fn openclaw_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(OPENCLAW_CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path.trim()));
    }
    crate::loader::home_dir().map(|h| h.join(".openclaw").join("openclaw.json"))
}

/// Read `gateway.auth.token` from an OpenClaw config file.
///
/// Missing files, parse failures and absent or blank tokens all yield `None`.
pub fn read_openclaw_token(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = match json5::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unparseable openclaw config");
            return None;
        },
    };
    value
        .pointer("/gateway/auth/token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_token_from_json5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openclaw.json");
        std::fs::write(
            &path,
            "{\n  // local gateway\n  gateway: { port: 18789, auth: { mode: 'token', token: 'tok_local' } },\n}\n",
        )
        .unwrap();
        assert_eq!(read_openclaw_token(&path).as_deref(), Some("tok_local"));
    }

    #[test]
    fn blank_or_missing_token_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openclaw.json");
        std::fs::write(&path, r#"{"gateway":{"auth":{"token":"  "}}}"#).unwrap();
        assert!(read_openclaw_token(&path).is_none());
        assert!(read_openclaw_token(&dir.path().join("absent.json")).is_none());
    }
}
