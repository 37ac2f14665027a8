//! Encrypted on-disk credential store.
//!
//! One AES-256-GCM encrypted JSON file under the user's config directory:
//! 12-byte random nonce, ciphertext, 16-byte tag appended by the AEAD.
//! Written atomically (temp file + rename) with mode 0600. Not safe for
//! concurrent external mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// 64-char hex master key override. When set, the store never writes a key
/// file (the key itself is read-only).
pub const MASTER_KEY_ENV: &str = "MCP_BRIDGE_MASTER_KEY";

const STORE_FILE: &str = "credentials.enc";
const KEY_FILE: &str = "master.key";
const NONCE_LEN: usize = 12;

/// A stored credential, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Bearer {
        token: String,
    },
    /// OAuth2 configuration passthrough; the bridge never interprets it.
    Oauth2 {
        #[serde(flatten)]
        config: serde_json::Value,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    version: u32,
    credentials: BTreeMap<String, Credential>,
}

impl Default for CredentialFile {
    fn default() -> Self {
        Self {
            version: 1,
            credentials: BTreeMap::new(),
        }
    }
}

pub struct CredentialStore {
    dir: PathBuf,
    master_key: [u8; 32],
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Open the store in the per-user config directory.
    pub fn open_default() -> Result<Self> {
        let dir = directories::ProjectDirs::from("", "", "crabeye-mcp-bridge")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| BridgeError::Credential("cannot locate config directory".into()))?;
        Self::open(dir)
    }

    /// Open the store in `dir`, resolving the master key from the
    /// environment, the key file, or (for a brand-new store) a fresh key.
    pub fn open(dir: PathBuf) -> Result<Self> {
        if let Ok(hex_key) = std::env::var(MASTER_KEY_ENV) {
            let key = parse_hex_key(&hex_key)?;
            return Ok(Self::open_with_key(dir, key));
        }

        let key_path = dir.join(KEY_FILE);
        if key_path.exists() {
            let raw = fs::read_to_string(&key_path)
                .map_err(|e| BridgeError::Credential(format!("cannot read key file: {e}")))?;
            let key = parse_hex_key(raw.trim())?;
            return Ok(Self::open_with_key(dir, key));
        }

        // A store without its key is unrecoverable; refuse to mint a new
        // key over existing data.
        if dir.join(STORE_FILE).exists() {
            return Err(BridgeError::Credential(format!(
                "credential store exists but {KEY_FILE} is missing and {MASTER_KEY_ENV} is not set"
            )));
        }

        let mut key = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut key);
        fs::create_dir_all(&dir)
            .map_err(|e| BridgeError::Credential(format!("cannot create store dir: {e}")))?;
        write_private(&key_path, hex::encode(key).as_bytes())?;
        tracing::info!(path = %key_path.display(), "generated new credential master key");
        Ok(Self::open_with_key(dir, key))
    }

    /// Open with an explicit key; used by `open` and by tests.
    pub fn open_with_key(dir: PathBuf, master_key: [u8; 32]) -> Self {
        Self { dir, master_key }
    }

    pub fn set(&self, key: &str, credential: Credential) -> Result<()> {
        let mut file = self.load_file()?;
        file.credentials.insert(key.to_string(), credential);
        self.save_file(&file)
    }

    pub fn get(&self, key: &str) -> Result<Option<Credential>> {
        Ok(self.load_file()?.credentials.remove(key))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut file = self.load_file()?;
        let removed = file.credentials.remove(key).is_some();
        if removed {
            self.save_file(&file)?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.load_file()?.credentials.into_keys().collect())
    }

    fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    fn load_file(&self) -> Result<CredentialFile> {
        let path = self.store_path();
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default());
            }
            Err(e) => {
                return Err(BridgeError::Credential(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        let plaintext = self.decrypt(&blob)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| BridgeError::Credential(format!("corrupt credential store: {e}")))
    }

    fn save_file(&self, file: &CredentialFile) -> Result<()> {
        let plaintext = serde_json::to_vec(file)
            .map_err(|e| BridgeError::Credential(format!("cannot serialize store: {e}")))?;
        let blob = self.encrypt(&plaintext)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| BridgeError::Credential(format!("cannot create store dir: {e}")))?;
        write_private(&self.store_path(), &blob)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(&self.master_key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| BridgeError::Credential(format!("encryption failed: {e}")))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(BridgeError::Credential(
                "corrupt credential store: too short".into(),
            ));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let key = Key::<Aes256Gcm>::from_slice(&self.master_key);
        let cipher = Aes256Gcm::new(key);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                BridgeError::Credential(
                    "decryption failed (wrong master key or corrupt data)".into(),
                )
            })
    }
}

fn parse_hex_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw)
        .map_err(|e| BridgeError::Credential(format!("master key is not valid hex: {e}")))?;
    bytes.try_into().map_err(|_| {
        BridgeError::Credential("master key must be 64 hex characters (32 bytes)".into())
    })
}

/// Write via temp file + rename with owner-only permissions.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .map_err(|e| BridgeError::Credential(format!("cannot write {}: {e}", tmp.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| BridgeError::Credential(format!("cannot set permissions: {e}")))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| BridgeError::Credential(format!("cannot rename into place: {e}")))?;
    Ok(())
}
