//! Helper binary pinning: the webserver only ever executes the exact
//! auth-helper and bridge binaries it was built against.

use std::io::Read as _;

use anyhow::Context as _;
use camino::Utf8Path;
use sha2::{Digest as _, Sha256};

/// Values stamped in at build time by the packaging pipeline.
pub fn embedded_bridge_sha256() -> Option<&'static str> {
    option_env!("LINUXIO_BRIDGE_SHA256")
}

pub fn embedded_auth_helper_sha256() -> Option<&'static str> {
    option_env!("LINUXIO_AUTH_HELPER_SHA256")
}

#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("binary {path} does not match its pinned hash")]
    Mismatch { path: String },
    #[error("no pinned hash available for {path}")]
    NoPin { path: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn sha256_file(path: &Utf8Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path).with_context(|| format!("couldn't open {path}"))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).with_context(|| format!("couldn't read {path}"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compares the binary at `path` against the expected hex digest.
///
/// Without a pin this fails in release builds; debug builds merely warn so
/// local iteration stays possible.
pub fn verify_binary(path: &Utf8Path, expected_hex: Option<&str>) -> Result<(), PinError> {
    let Some(expected) = expected_hex else {
        if cfg!(debug_assertions) {
            warn!(%path, "No pinned hash, skipping verification (debug build)");
            return Ok(());
        }
        return Err(PinError::NoPin { path: path.to_string() });
    };

    let actual = sha256_file(path)?;

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PinError::Mismatch { path: path.to_string() })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn verify_detects_single_byte_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("binary")).unwrap();

        std::fs::write(&path, b"original contents").unwrap();
        let pinned = sha256_file(&path).unwrap();

        verify_binary(&path, Some(&pinned)).unwrap();

        std::fs::write(&path, b"original Contents").unwrap();
        let err = verify_binary(&path, Some(&pinned)).unwrap_err();
        assert!(matches!(err, PinError::Mismatch { .. }));
    }

    #[test]
    fn digest_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("empty")).unwrap();
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
