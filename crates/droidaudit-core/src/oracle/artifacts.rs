use std::fs;
use std::path::{Path, PathBuf};

use super::ArtifactRef;
use crate::canonical::sha256_hex;
use crate::error::{AuditError, AuditResult};
use crate::jsonl::write_atomic;

pub const ORACLE_ARTIFACTS_DIR: &str = "oracle_artifacts";

/// Content-addressed store for raw oracle output under `<episode>/oracle_artifacts/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    episode_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(episode_dir: &Path) -> Self {
        Self {
            episode_dir: episode_dir.to_path_buf(),
        }
    }

    /// Stores `bytes` as `<sha256>.<ext>`. Identical content is written once.
    pub fn put(&self, bytes: &[u8], ext: &str, mime: &str) -> AuditResult<ArtifactRef> {
        let sha256 = sha256_hex(bytes);
        let ext = ext.trim_start_matches('.');
        let rel = format!("{ORACLE_ARTIFACTS_DIR}/{sha256}.{ext}");
        let dir = self.episode_dir.join(ORACLE_ARTIFACTS_DIR);
        fs::create_dir_all(&dir).map_err(|e| AuditError::io(&dir, e))?;
        let path = self.episode_dir.join(&rel);
        if !path.is_file() {
            write_atomic(&path, bytes)?;
        }
        Ok(ArtifactRef {
            path: rel,
            sha256,
            size_bytes: bytes.len() as u64,
            mime: mime.to_string(),
        })
    }

    pub fn put_text(&self, text: &str) -> AuditResult<ArtifactRef> {
        self.put(text.as_bytes(), "txt", "text/plain")
    }

    /// Re-hashes the stored file; false when it is missing or altered.
    pub fn verify(&self, artifact: &ArtifactRef) -> bool {
        match fs::read(self.episode_dir.join(&artifact.path)) {
            Ok(bytes) => {
                bytes.len() as u64 == artifact.size_bytes && sha256_hex(&bytes) == artifact.sha256
            }
            Err(_) => false,
        }
    }
}
