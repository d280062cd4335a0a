//! Access token storage
//!
//! The token is opaque bytes in memory and standard base64 text on disk. A
//! missing or unreadable token file is a normal first-run state, not an error.

use crate::error::{Result, RestError};
use base64::{engine::general_purpose, Engine};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// In-memory access token, optionally mirrored to a file
#[derive(Debug, Default)]
pub struct TokenStore {
    path: Option<PathBuf>,
    token: Option<Vec<u8>>,
}

impl TokenStore {
    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the token from `path` if configured; failures leave it absent
    pub fn load(path: Option<PathBuf>) -> Self {
        let token = path.as_deref().and_then(read_token);
        Self { path, token }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    /// Replace the token with the decoded form of `encoded` and persist it.
    ///
    /// Nothing changes when `encoded` is not valid base64. A persistence
    /// failure is returned after the in-memory token has been replaced.
    pub fn replace_from_base64(&mut self, encoded: &str) -> Result<()> {
        let token = general_purpose::STANDARD.decode(encoded.trim())?;
        self.token = Some(token);

        if let Some(path) = &self.path {
            write_private(path, encoded.trim().as_bytes()).map_err(RestError::Persistence)?;
            log::debug!("Token: saved to {}", path.display());
        }
        Ok(())
    }
}

fn read_token(path: &Path) -> Option<Vec<u8>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Token: cannot read {}, {e}", path.display());
            return None;
        }
    };
    match general_purpose::STANDARD.decode(text.trim()) {
        Ok(token) => Some(token),
        Err(e) => {
            log::warn!("Token: {} is not valid base64, {e}", path.display());
            None
        }
    }
}

/// Write `contents` readable and writable by the owner only
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        let mut file = options.open(path)?;
        // mode() only applies on creation
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)
    }
    #[cfg(not(unix))]
    {
        options.open(path)?.write_all(contents)
    }
}
