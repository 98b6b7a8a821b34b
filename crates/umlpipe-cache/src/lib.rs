//! Content-addressed conversion cache.
//!
//! [`ContentCache`] wraps any [`Converter`] and stores each result as one file
//! named by the SHA-256 of its markup:
//!
//! ```text
//! {root}/
//! +-- 3f2a…9c   # image bytes for one markup, no header
//! +-- 8b01…d4
//! ```
//!
//! Entries never expire and are never re-verified. Identical markup maps to
//! the same file across runs, so a populated entry is served without touching
//! the engine even after a restart.
//!
//! Entries are published with a write to a temporary sibling followed by a
//! rename, so an interrupted population never leaves a partial file under the
//! final name. A file that is already corrupt (for instance written by an
//! older tool without that guarantee) is indistinguishable from a good one and
//! is served as-is.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use umlpipe_convert::{ConvertError, Converter, write_atomic};

/// Lowercase hex SHA-256 of `markup`.
#[must_use]
pub fn content_hash(markup: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(markup.as_bytes());
    hex::encode(hasher.finalize())
}

/// [`Converter`] that memoizes another converter's output on disk.
pub struct ContentCache<C> {
    inner: C,
    root: PathBuf,
}

impl<C: Converter> ContentCache<C> {
    /// Cache `inner` under `root`. The directory is created on first write.
    pub fn new(inner: C, root: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            root: root.into(),
        }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wrapped converter.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// File holding the cached image for `markup`.
    pub fn entry_path(&self, markup: &str) -> PathBuf {
        self.root.join(content_hash(markup))
    }
}

#[async_trait]
impl<C: Converter> Converter for ContentCache<C> {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        let entry = self.entry_path(markup);

        if tokio::fs::metadata(&entry).await.is_ok_and(|m| m.is_file()) {
            tracing::debug!(entry = %entry.display(), "Cache hit");
        } else {
            tracing::debug!(entry = %entry.display(), "Cache miss");
            let image = self.inner.convert_to_vec(markup).await?;
            write_atomic(&entry, &image).await?;
        }

        let mut file = tokio::fs::File::open(&entry).await?;
        tokio::io::copy(&mut file, output).await?;
        output.flush().await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ConvertError> {
        self.inner.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;
    use umlpipe_convert::MockConverter;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nimage";

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash("A --> B").len(), 64);
    }

    #[tokio::test]
    async fn test_second_conversion_is_served_from_disk() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::new(PNG), tmp.path());

        let first = cache.convert_to_vec("A --> B").await.unwrap();
        let second = cache.convert_to_vec("A --> B").await.unwrap();

        assert_eq!(cache.inner().calls(), 1);
        assert_eq!(first, PNG);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_markups_get_distinct_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::new(PNG), tmp.path());

        cache.convert_to_vec("A --> B").await.unwrap();
        cache.convert_to_vec("B --> A").await.unwrap();

        let a = cache.entry_path("A --> B");
        let b = cache.entry_path("B --> A");
        assert_ne!(a, b);
        assert!(a.is_file());
        assert!(b.is_file());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 2);
        assert_eq!(cache.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_entry_path_is_stable_across_instances() {
        let tmp = TempDir::new().unwrap();
        let first = ContentCache::new(MockConverter::new(PNG), tmp.path());
        first.convert_to_vec("A --> B").await.unwrap();

        let second = ContentCache::new(MockConverter::new(b"other".as_slice()), tmp.path());
        assert_eq!(second.entry_path("A --> B"), first.entry_path("A --> B"));
        assert_eq!(second.convert_to_vec("A --> B").await.unwrap(), PNG);
        assert_eq!(second.inner().calls(), 0);
    }

    #[tokio::test]
    async fn test_entry_file_holds_raw_image() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::new(PNG), tmp.path().join("nested"));

        cache.convert_to_vec("A --> B").await.unwrap();

        let entry = tmp.path().join("nested").join(content_hash("A --> B"));
        assert_eq!(std::fs::read(entry).unwrap(), PNG);
    }

    #[tokio::test]
    async fn test_partial_entry_is_served_as_is() {
        // Entries are never re-verified: a truncated file left by some other
        // writer is returned without consulting the engine.
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::new(PNG), tmp.path());
        std::fs::write(cache.entry_path("A --> B"), &PNG[..4]).unwrap();

        let image = cache.convert_to_vec("A --> B").await.unwrap();

        assert_eq!(image, &PNG[..4]);
        assert_eq!(cache.inner().calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::failing(), tmp.path());

        let mut output = Vec::new();
        let err = cache.convert("A --> B", &mut output).await.unwrap_err();

        assert!(matches!(err, ConvertError::EngineExited { .. }));
        assert!(output.is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_population_settles_on_one_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::new(MockConverter::new(PNG), tmp.path()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.convert_to_vec("A --> B").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), PNG);
        }

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_forwards_to_inner() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(MockConverter::new(PNG), tmp.path());

        cache.dispose().await.unwrap();
        cache.dispose().await.unwrap();

        assert_eq!(cache.inner().disposals(), 2);
    }
}
