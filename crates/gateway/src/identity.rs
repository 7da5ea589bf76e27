//! Device identity: a long-lived Ed25519 keypair persisted on disk.
//!
//! Pairing binds to the public key, so regenerating the identity orphans
//! every pairing the gateway granted the old one. The private key is only
//! ever used in-process to sign connect challenges.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{Context, Result},
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    castle_protocol::DeviceAuth,
    ed25519_dalek::{Signer, SigningKey},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::{info, warn},
};

const IDENTITY_FILE_VERSION: u32 = 1;

/// The fields the gateway reconstructs to verify a device signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePayload<'a> {
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl SignaturePayload<'_> {
    /// `v2|deviceId|clientId|clientMode|role|scopes|signedAtMs|token|nonce`,
    /// or the `v1` form without the trailing nonce when none was issued.
    pub fn canonical(&self, device_id: &str, signed_at_ms: i64) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let signed_at = signed_at_ms.to_string();
        let scopes = self.scopes.join(",");
        let mut parts = vec![
            version,
            device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or_default(),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key: String,
    private_key: String,
    created_at_ms: u64,
}

pub struct DeviceIdentity {
    device_id: String,
    public_key: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Fresh keypair, not persisted.
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public = signing_key.verifying_key().to_bytes();
        Self {
            device_id: device_id_for(&public),
            public_key: URL_SAFE_NO_PAD.encode(public),
            signing_key,
        }
    }

    /// Load the identity at `path`, creating and persisting one if the file
    /// is missing. A corrupt or inconsistent file is replaced.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(Some(identity)) => return Ok(identity),
            Ok(None) => {},
            Err(e) => {
                warn!(path = %path.display(), error = %e, "device identity unreadable, regenerating");
            },
        }
        let identity = Self::generate();
        identity.save(path)?;
        info!(device_id = %identity.device_id, path = %path.display(), "generated device identity");
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read device identity"),
        };
        let stored: StoredIdentity = serde_json::from_str(&data).context("parse device identity")?;
        let secret = URL_SAFE_NO_PAD
            .decode(stored.private_key.as_bytes())
            .context("decode private key")?;
        let seed: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));
        if identity.device_id != stored.device_id || identity.public_key != stored.public_key {
            anyhow::bail!("stored device id does not match its key");
        }
        Ok(Some(identity))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredIdentity {
            version: IDENTITY_FILE_VERSION,
            device_id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
            created_at_ms: now_ms(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw 32-byte public key, base64url without padding.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign the canonical payload and build the `device` block of a connect.
    pub fn sign(&self, payload: &SignaturePayload<'_>) -> DeviceAuth {
        self.sign_at(payload, now_ms() as i64)
    }

    pub fn sign_at(&self, payload: &SignaturePayload<'_>, signed_at_ms: i64) -> DeviceAuth {
        let message = payload.canonical(&self.device_id, signed_at_ms);
        let signature = self.signing_key.sign(message.as_bytes());
        DeviceAuth {
            id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            signed_at: signed_at_ms,
            nonce: payload.nonce.map(str::to_string),
        }
    }
}

/// Lowercase hex SHA-256 of the raw public key.
pub fn device_id_for(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Default identity location under the config directory.
pub fn default_identity_path() -> Option<PathBuf> {
    castle_config::config_dir().map(|d| d.join("identity").join("device.json"))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
