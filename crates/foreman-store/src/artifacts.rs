use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use foreman_types::{ArtifactKind, ArtifactMeta, ForemanError, Result};

use crate::db::ProjectStore;

/// Content-addressed file storage under the project root. Writes are
/// temp-then-rename, and identical bytes land on the same path, so no lock
/// is needed.
pub struct ArtifactStore {
    project_root: PathBuf,
}

pub const ARTIFACTS_DIR: &str = ".foreman/artifacts";

impl ArtifactStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    /// Relative storage path derived from kind and content hash:
    /// `.foreman/artifacts/<kind>/<hh>/<hash>`.
    pub fn rel_path_for(kind: ArtifactKind, hash: &str) -> String {
        format!("{ARTIFACTS_DIR}/{}/{}/{hash}", kind.dir_name(), &hash[..2])
    }

    pub fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex_encode(&hasher.finalize())
    }

    /// Store bytes and register a metadata row. Re-putting identical bytes
    /// returns the existing row.
    pub async fn put(
        &self,
        store: &ProjectStore,
        bytes: &[u8],
        kind: ArtifactKind,
        run_id: Option<i64>,
        task_id: Option<i64>,
    ) -> Result<ArtifactMeta> {
        let hash = Self::hash_bytes(bytes);
        if let Some(existing) = store.find_artifact_by_hash(kind, &hash).await? {
            return Ok(existing);
        }

        let rel = Self::rel_path_for(kind, &hash);
        let abs = self.resolve_inside_root(&rel)?;
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = abs.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &abs).await?;

        let meta = store
            .insert_artifact(kind, &rel, &hash, bytes.len() as i64, run_id, task_id)
            .await?;
        Ok(meta)
    }

    pub async fn read(&self, meta: &ArtifactMeta) -> Result<Vec<u8>> {
        let abs = self.resolve_inside_root(&meta.path)?;
        Ok(fs::read(abs).await?)
    }

    pub async fn open(&self, meta: &ArtifactMeta) -> Result<fs::File> {
        let abs = self.resolve_inside_root(&meta.path)?;
        Ok(fs::File::open(abs).await?)
    }

    /// Paths are derived from kind + hex digest, so escaping the root would
    /// take a corrupted metadata row; treat that as a security violation.
    fn resolve_inside_root(&self, rel: &str) -> Result<PathBuf> {
        let candidate = Path::new(rel);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ForemanError::Forbidden(format!(
                "artifact path escapes project root: {rel}"
            )));
        }
        Ok(self.project_root.join(candidate))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
