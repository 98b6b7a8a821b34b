//! The converter contract shared by every backend and the cache.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::ConvertError;

/// Converts diagram markup into image bytes.
///
/// Implementations own whatever engine resources they start and release them
/// in [`dispose`](Self::dispose), which must be safe to call repeatedly.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `markup` and write the image bytes to `output`.
    ///
    /// Success is signaled only by returning `Ok`; nothing is written to
    /// `output` when conversion fails.
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError>;

    /// Release all owned resources. Idempotent.
    async fn dispose(&self) -> Result<(), ConvertError>;

    /// Convert `markup` into an in-memory image.
    async fn convert_to_vec(&self, markup: &str) -> Result<Vec<u8>, ConvertError> {
        let mut image = Vec::new();
        self.convert(markup, &mut image).await?;
        Ok(image)
    }

    /// Convert `markup` into the file at `path`, creating parent directories.
    ///
    /// The file is replaced atomically, so a failed conversion never leaves a
    /// partial image at `path`.
    async fn convert_to_file(&self, markup: &str, path: &Path) -> Result<PathBuf, ConvertError> {
        let image = self.convert_to_vec(markup).await?;
        write_atomic(path, &image).await?;
        Ok(path.to_path_buf())
    }
}

#[async_trait]
impl<C: Converter + ?Sized> Converter for Arc<C> {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        (**self).convert(markup, output).await
    }

    async fn dispose(&self) -> Result<(), ConvertError> {
        (**self).dispose().await
    }
}

#[async_trait]
impl<C: Converter + ?Sized> Converter for Box<C> {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        (**self).convert(markup, output).await
    }

    async fn dispose(&self) -> Result<(), ConvertError> {
        (**self).dispose().await
    }
}

/// Write `data` to `path` through a uniquely named sibling and a rename.
///
/// Readers of `path` see either the previous file or the complete new one.
/// Concurrent writers of the same path resolve last-writer-wins.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
        .to_string_lossy();
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}
