//! JWT issuance and validation, and the persisted signing secret.
//!
//! Tokens are only ever minted locally (`--print-token`); the HTTP surface can
//! validate them but never hands them out.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, HeaderMap, Uri};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};

pub const ISSUER: &str = "chowkidar-server";
pub const USER_AGENT: &str = "chowkidar-agent";
pub const KEY_FILE_NAME: &str = ".chowkidar-secret-key";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub server_name: String,
    pub user_agent: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl Claims {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// HS256 signer/verifier bound to one secret and server name.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    server_name: String,
}

impl TokenAuthority {
    pub fn new(secret: &str, ttl: Duration, server_name: impl Into<String>) -> Self {
        let secret = pad_secret(secret.trim());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_nbf = true;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        self.sign(&Claims {
            server_name: self.server_name.clone(),
            user_agent: USER_AGENT.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl),
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AgentError::Signing(e.to_string()))
    }

    /// Checks signature, algorithm, issuer and the time claims.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        if token.is_empty() {
            return Err(AgentError::MissingToken);
        }
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AgentError::InvalidToken(e.to_string()))
    }
}

/// Extends secrets shorter than 32 bytes with random hex.
fn pad_secret(secret: &str) -> String {
    if secret.len() >= MIN_SECRET_LEN {
        return secret.to_string();
    }
    warn!(
        len = secret.len(),
        "secret key shorter than {MIN_SECRET_LEN} bytes, padding with random bytes"
    );
    let mut pad = vec![0u8; MIN_SECRET_LEN - secret.len()];
    rand::thread_rng().fill_bytes(&mut pad);
    format!("{secret}{}", hex(&pad))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `~/.chowkidar-secret-key`, or the temp dir when there is no home directory.
pub fn default_key_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(KEY_FILE_NAME)
}

/// An explicit secret wins. Otherwise the key file is read, or created with a
/// fresh secret (mode 0600) when it does not exist yet.
pub fn resolve_secret(explicit: Option<&str>, key_file: &Path) -> Result<String> {
    if let Some(s) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(s.to_string());
    }
    let key_err = |source| AgentError::KeyFile {
        path: key_file.display().to_string(),
        source,
    };
    match fs::read_to_string(key_file) {
        Ok(s) if !s.trim().is_empty() => {
            info!(path = %key_file.display(), "loaded persisted secret key");
            return Ok(s.trim().to_string());
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(key_err(e)),
    }

    let secret = generate_secret();
    write_private(key_file, secret.as_bytes()).map_err(key_err)?;
    info!(path = %key_file.display(), "generated and persisted secret key");
    Ok(secret)
}

fn generate_secret() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("chowkidar-{host}-{}", hex(&bytes))
}

fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(data)
}

/// Bearer header first, then the percent-decoded `token` query parameter.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params.remove("token").filter(|t| !t.is_empty())
}
