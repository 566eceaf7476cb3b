//! Multipart files spooled to a local temp directory before they go to the media store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub path: PathBuf,
    pub content_type: String,
}

impl UploadedFile {
    /// Writes `body` under `dir` with a collision-free name derived from the client's file name.
    pub async fn persist(
        dir: &Path,
        file_name: Option<&str>,
        content_type: &str,
        body: Bytes,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create upload dir {}", dir.display()))?;
        let path = dir.join(format!("{}-{}", Uuid::new_v4(), sanitize(file_name.unwrap_or("upload"))));
        tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            path,
            content_type: content_type.to_string(),
        })
    }

    /// Removes the temp file if it is still there.
    pub async fn discard(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "failed to remove temp upload"),
        }
    }
}

fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".into()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_odd_chars() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\photos\\me.png"), "me.png");
        assert_eq!(sanitize("my avatar (1).jpg"), "my_avatar__1_.jpg");
        assert_eq!(sanitize(".."), "upload");
    }

    #[tokio::test]
    async fn persist_then_discard() {
        let dir = std::env::temp_dir().join(format!("uploads-{}", Uuid::new_v4()));
        let file = UploadedFile::persist(&dir, Some("a.png"), "image/png", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(file.path.starts_with(&dir));
        assert!(file.path.exists());

        file.discard().await;
        assert!(!file.path.exists());
        // second discard is a no-op
        file.discard().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
