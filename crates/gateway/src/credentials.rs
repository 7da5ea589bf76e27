//! Bearer-token resolution.
//!
//! Sources are consulted in order and the first one that yields a token
//! wins; nothing is merged. The stored device token always comes first,
//! then the configured static sources.

use std::path::{Path, PathBuf};

use {
    anyhow::Result,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

/// Environment variable consulted last.
pub const GATEWAY_TOKEN_ENV: &str = "OPENCLAW_GATEWAY_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    DeviceToken,
    Config,
    ExternalConfig,
    Environment,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DeviceToken => "device token",
            Self::Config => "config",
            Self::ExternalConfig => "openclaw config",
            Self::Environment => "environment",
        };
        f.write_str(s)
    }
}

/// A token plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub token: Secret<String>,
    pub source: CredentialSource,
}

impl ResolvedCredential {
    pub fn is_device_token(&self) -> bool {
        self.source == CredentialSource::DeviceToken
    }
}

// ── Device token store ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDeviceToken {
    token: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    issued_at_ms: u64,
}

/// File-backed storage for the token issued after pairing approval.
#[derive(Debug, Clone)]
pub struct DeviceTokenStore {
    path: PathBuf,
}

impl DeviceTokenStore {
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<config dir>/identity/device-auth.json`.
    pub fn default_path() -> Option<PathBuf> {
        castle_config::config_dir().map(|d| d.join("identity").join("device-auth.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<Secret<String>> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredDeviceToken>(&data) {
            Ok(stored) if !stored.token.is_empty() => Some(Secret::new(stored.token)),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable device token");
                None
            },
        }
    }

    pub fn save(&self, token: &str, role: Option<&str>, scopes: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredDeviceToken {
            token: token.to_string(),
            role: role.map(str::to_string),
            scopes: scopes.to_vec(),
            issued_at_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        debug!(path = %self.path.display(), "saved device token");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Static sources ───────────────────────────────────────────────────────────

/// One place a static token may come from.
pub trait TokenSource: Send + Sync {
    fn kind(&self) -> CredentialSource;
    fn token(&self) -> Option<String>;
}

/// Token from the local config file.
pub struct ConfigToken(pub Option<String>);

impl TokenSource for ConfigToken {
    fn kind(&self) -> CredentialSource {
        CredentialSource::Config
    }

    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// `gateway.auth.token` from an OpenClaw config file.
pub struct OpenClawConfigToken {
    path: Option<PathBuf>,
}

impl OpenClawConfigToken {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn discover() -> Self {
        Self::new(castle_config::external::openclaw_config_path())
    }
}

impl TokenSource for OpenClawConfigToken {
    fn kind(&self) -> CredentialSource {
        CredentialSource::ExternalConfig
    }

    fn token(&self) -> Option<String> {
        self.path
            .as_deref()
            .and_then(castle_config::external::read_openclaw_token)
    }
}

/// Token from an environment variable.
pub struct EnvToken(pub &'static str);

impl TokenSource for EnvToken {
    fn kind(&self) -> CredentialSource {
        CredentialSource::Environment
    }

    fn token(&self) -> Option<String> {
        std::env::var(self.0).ok()
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

pub struct CredentialResolver {
    device_tokens: DeviceTokenStore,
    sources: Vec<Box<dyn TokenSource>>,
}

impl CredentialResolver {
    /// Resolver with no static sources; add them with [`Self::with_source`].
    pub fn new(device_tokens: DeviceTokenStore) -> Self {
        Self {
            device_tokens,
            sources: Vec::new(),
        }
    }

    /// The standard chain: config token, OpenClaw config, environment.
    pub fn standard(device_tokens: DeviceTokenStore, config_token: Option<String>) -> Self {
        Self::new(device_tokens)
            .with_source(ConfigToken(config_token))
            .with_source(OpenClawConfigToken::discover())
            .with_source(EnvToken(GATEWAY_TOKEN_ENV))
    }

    pub fn with_source(mut self, source: impl TokenSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn device_tokens(&self) -> &DeviceTokenStore {
        &self.device_tokens
    }

    /// First available credential, device token included.
    pub fn resolve(&self) -> Option<ResolvedCredential> {
        if let Some(token) = self.device_tokens.load() {
            return Some(ResolvedCredential {
                token,
                source: CredentialSource::DeviceToken,
            });
        }
        self.static_token()
    }

    /// First available static credential, skipping the device token.
    pub fn static_token(&self) -> Option<ResolvedCredential> {
        self.sources.iter().find_map(|source| {
            let token = source.token()?;
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            Some(ResolvedCredential {
                token: Secret::new(token.to_string()),
                source: source.kind(),
            })
        })
    }
}

/// Shorthand for the token text of a resolved credential.
pub fn expose(credential: &ResolvedCredential) -> &str {
    credential.token.expose_secret()
}

#[cfg(test)]
mod tests {
    use {super::*, serial_test::serial};

    struct Fixed(CredentialSource, Option<&'static str>);

    impl TokenSource for Fixed {
        fn kind(&self) -> CredentialSource {
            self.0
        }

        fn token(&self) -> Option<String> {
            self.1.map(str::to_string)
        }
    }

    fn store(dir: &tempfile::TempDir) -> DeviceTokenStore {
        DeviceTokenStore::with_path(dir.path().join("device-auth.json"))
    }

    #[test]
    fn device_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        tokens.save("dtok_1", Some("operator"), &[]).unwrap();
        let resolver = CredentialResolver::new(tokens)
            .with_source(Fixed(CredentialSource::Config, Some("tok_cfg")));

        let cred = resolver.resolve().unwrap();
        assert_eq!(cred.source, CredentialSource::DeviceToken);
        assert_eq!(expose(&cred), "dtok_1");

        let fallback = resolver.static_token().unwrap();
        assert_eq!(fallback.source, CredentialSource::Config);
        assert_eq!(expose(&fallback), "tok_cfg");
    }

    #[test]
    fn first_non_blank_source_wins_without_merging() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CredentialResolver::new(store(&dir))
            .with_source(Fixed(CredentialSource::Config, None))
            .with_source(Fixed(CredentialSource::ExternalConfig, Some("   ")))
            .with_source(Fixed(CredentialSource::Environment, Some("tok_env")));

        let cred = resolver.resolve().unwrap();
        assert_eq!(cred.source, CredentialSource::Environment);
        assert_eq!(expose(&cred), "tok_env");
    }

    #[test]
    fn nothing_configured_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CredentialResolver::new(store(&dir))
            .with_source(Fixed(CredentialSource::Config, None));
        assert!(resolver.resolve().is_none());
    }

    #[test]
    fn clear_removes_token_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);
        tokens.save("dtok_1", None, &[]).unwrap();
        assert!(tokens.load().is_some());
        tokens.clear().unwrap();
        assert!(tokens.load().is_none());
        tokens.clear().unwrap();
    }

    #[test]
    fn openclaw_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openclaw.json");
        std::fs::write(&path, "{ gateway: { auth: { token: 'tok_oc' } } }").unwrap();
        let source = OpenClawConfigToken::new(Some(path));
        assert_eq!(source.token().as_deref(), Some("tok_oc"));
        assert!(OpenClawConfigToken::new(None).token().is_none());
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn env_source_reads_variable() {
        unsafe { std::env::set_var("CASTLE_CRED_TEST_TOKEN", "tok_env") };
        assert_eq!(
            EnvToken("CASTLE_CRED_TEST_TOKEN").token().as_deref(),
            Some("tok_env")
        );
        unsafe { std::env::remove_var("CASTLE_CRED_TEST_TOKEN") };
        assert!(EnvToken("CASTLE_CRED_TEST_TOKEN").token().is_none());
    }
}
