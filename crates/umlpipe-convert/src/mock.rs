//! In-memory converter for tests of code that consumes [`Converter`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::converter::Converter;
use crate::error::ConvertError;

/// Converter returning canned bytes (or a canned failure) and recording calls.
#[derive(Debug, Default)]
pub struct MockConverter {
    output: Vec<u8>,
    fail: bool,
    calls: AtomicUsize,
    disposals: AtomicUsize,
    markups: Mutex<Vec<String>>,
}

impl MockConverter {
    /// Mock that answers every conversion with `output`.
    #[must_use]
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    /// Mock whose conversions fail with [`ConvertError::EngineExited`].
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of `convert` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls so far.
    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Markups received, in call order.
    pub fn markups(&self) -> Vec<String> {
        self.markups
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(
        &self,
        markup: &str,
        output: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<(), ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut markups) = self.markups.lock() {
            markups.push(markup.to_owned());
        }
        if self.fail {
            return Err(ConvertError::EngineExited { status: None });
        }
        output.write_all(&self.output).await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ConvertError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
