//! Context reference tokens: `ctx_<payload_b64>.<sig_b64>` handed back
//! by `save_snippet`/`archive_context` so a client can cheaply prove it
//! already holds a given context without re-fetching it from storage.
//!
//! Payload is canonical JSON (`serde_json`'s default map is a `BTreeMap`,
//! so keys come out sorted with no extra work) signed with HMAC-SHA256
//! under a key looked up by `kid`. Keys live in `ctx_keys.json`, mode 0600.

use crate::error::{Result, SariError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;
const TOKEN_PREFIX: &str = "ctx_";

#[derive(Serialize, Deserialize, Default)]
struct KeyFile {
    active_kid: Option<String>,
    keys: HashMap<String, String>,
}

/// Holds the signing keyring in memory, backed by an on-disk file.
pub struct KeyStore {
    path: PathBuf,
    keys: HashMap<String, Vec<u8>>,
    active_kid: String,
}

impl KeyStore {
    /// Loads the keyring from `path`, generating and persisting a fresh
    /// key if the file is absent or unreadable.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let loaded = std::fs::read_to_string(path).ok().and_then(|s| serde_json::from_str::<KeyFile>(&s).ok());

        let mut file = loaded.unwrap_or_default();
        if file.active_kid.is_none() || !file.keys.contains_key(file.active_kid.as_deref().unwrap_or_default()) {
            let kid = new_kid();
            let key = random_key();
            file.keys.insert(kid.clone(), URL_SAFE_NO_PAD.encode(key));
            file.active_kid = Some(kid);
            write_key_file(path, &file)?;
        }

        let active_kid = file.active_kid.clone().unwrap();
        let mut keys = HashMap::new();
        for (kid, encoded) in &file.keys {
            let bytes = URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| SariError::Storage(format!("corrupt key {kid}: {e}")))?;
            keys.insert(kid.clone(), bytes);
        }

        Ok(KeyStore { path: path.to_path_buf(), keys, active_kid })
    }

    /// Issues a token whose payload is `{v:1, kid, iat, exp}` merged with
    /// `extra` fields, signed with the active key.
    pub fn issue(&self, extra: Map<String, Value>, ttl_secs: i64) -> Result<String> {
        let key = self
            .keys
            .get(&self.active_kid)
            .ok_or_else(|| SariError::Storage("no active signing key".to_string()))?;
        let now = now_unix();

        let mut payload = extra;
        payload.insert("v".to_string(), Value::from(1));
        payload.insert("kid".to_string(), Value::from(self.active_kid.clone()));
        payload.insert("iat".to_string(), Value::from(now));
        payload.insert("exp".to_string(), Value::from(now + ttl_secs));

        let payload_json = serde_json::to_vec(&Value::Object(payload))
            .map_err(|e| SariError::Storage(format!("payload encode: {e}")))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

        let sig = sign(key, payload_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(sig);

        Ok(format!("{TOKEN_PREFIX}{payload_b64}.{sig_b64}"))
    }

    /// Decodes and verifies a token: checks the signature under the key
    /// named by `kid` in constant time, then enforces `exp`.
    pub fn verify(&self, token: &str) -> Result<Map<String, Value>> {
        let rest = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| SariError::InvalidArgs("not a context token".to_string()))?;
        let (payload_b64, sig_b64) = rest
            .split_once('.')
            .ok_or_else(|| SariError::InvalidArgs("malformed context token".to_string()))?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| SariError::InvalidArgs("malformed context token payload".to_string()))?;
        let payload: Map<String, Value> = serde_json::from_slice(&payload_json)
            .map_err(|_| SariError::InvalidArgs("malformed context token payload".to_string()))?;

        let kid = payload
            .get("kid")
            .and_then(Value::as_str)
            .ok_or_else(|| SariError::InvalidArgs("context token missing kid".to_string()))?;
        let key = self
            .keys
            .get(kid)
            .ok_or_else(|| SariError::InvalidArgs("unknown context token key id".to_string()))?;

        let expected_sig = sign(key, payload_b64.as_bytes());
        let given_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| SariError::InvalidArgs("malformed context token signature".to_string()))?;
        if !constant_time_eq(&expected_sig, &given_sig) {
            return Err(SariError::InvalidArgs("context token signature mismatch".to_string()));
        }

        let exp = payload.get("exp").and_then(Value::as_i64).unwrap_or(0);
        if now_unix() > exp {
            return Err(SariError::InvalidArgs("context token expired".to_string()));
        }

        Ok(payload)
    }

    #[cfg(test)]
    fn active_kid(&self) -> &str {
        &self.active_kid
    }
}

fn sign(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn new_kid() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn random_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(unix)]
fn write_key_file(path: &Path, file: &KeyFile) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(file).map_err(|e| SariError::Storage(format!("key file encode: {e}")))?;
    std::fs::write(path, body)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, file: &KeyFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(file).map_err(|e| SariError::Storage(format!("key file encode: {e}")))?;
    std::fs::write(path, body)?;
    Ok(())
}

/// Default key file path, honoring no environment override (the data
/// directory override lives in `config::sari_data_dir`).
pub fn default_key_path() -> PathBuf {
    crate::config::sari_data_dir().join("ctx_keys.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn extra(topic: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("topic".to_string(), json!(topic));
        m
    }

    #[test]
    fn issue_then_verify_round_trips_payload() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_create(&dir.path().join("ctx_keys.json")).unwrap();
        let token = store.issue(extra("release-notes"), DEFAULT_TTL_SECS).unwrap();
        assert!(token.starts_with("ctx_"));

        let payload = store.verify(&token).unwrap();
        assert_eq!(payload.get("topic").unwrap(), "release-notes");
        assert_eq!(payload.get("kid").unwrap(), store.active_kid());
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_create(&dir.path().join("ctx_keys.json")).unwrap();
        let token = store.issue(extra("x"), DEFAULT_TTL_SECS).unwrap();
        let mut tampered = token.clone();
        tampered.push('a');
        assert!(store.verify(&tampered).is_err());
    }

    #[test]
    fn verify_rejects_expired_token() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_create(&dir.path().join("ctx_keys.json")).unwrap();
        let token = store.issue(extra("x"), -10).unwrap();
        assert!(store.verify(&token).is_err());
    }

    #[test]
    fn load_or_create_persists_key_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx_keys.json");
        let first = KeyStore::load_or_create(&path).unwrap();
        let token = first.issue(extra("x"), DEFAULT_TTL_SECS).unwrap();

        let second = KeyStore::load_or_create(&path).unwrap();
        assert!(second.verify(&token).is_ok());
    }
}
