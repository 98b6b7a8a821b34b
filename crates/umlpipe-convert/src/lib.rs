//! Diagram markup to image conversion through an external engine.
//!
//! This crate provides the conversion backends and the contract they share:
//! - [`Converter`]: async `convert` / `dispose` contract, with file and
//!   in-memory convenience forms
//! - [`PipeConverter`]: one long-lived engine process in pipe mode, with
//!   conversions serialized through a one-slot gate
//! - [`ServiceConverter`]: the engine's local HTTP server, restarted on a new
//!   port when it dies
//! - [`copy_until`] / [`copy_until_async`]: delimiter scanning that never
//!   consumes a byte past the delimiter
//!
//! # Architecture
//!
//! - `scanner`: ring-buffer delimiter scanner
//! - `markup`: end-marker handling and multi-diagram splitting
//! - `engine`: engine artifact resolution and process launch
//! - `pipe` / `service`: the two backends
//!
//! # Example
//!
//! ```ignore
//! use umlpipe_convert::{Converter, EngineSettings, PipeConverter};
//!
//! let converter = PipeConverter::new(EngineSettings::new());
//! converter
//!     .convert_to_file("A --> B", Path::new("out/diagram.png"))
//!     .await?;
//! converter.dispose().await?;
//! ```

mod consts;
mod converter;
mod engine;
mod error;
mod markup;
#[cfg(feature = "mock")]
mod mock;
mod pipe;
mod scanner;
mod service;
#[cfg(all(test, unix))]
mod testing;

pub use consts::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RENDER_TYPE, DEFAULT_STARTUP_TIMEOUT, DEFAULT_TIMEOUT,
};
pub use converter::{Converter, write_atomic};
pub use engine::EngineSettings;
pub use error::{ConvertError, ErrorKind};
pub use markup::{END_MARKER, ensure_end_marker, has_end_marker, single_unit, split_sections};
#[cfg(feature = "mock")]
pub use mock::MockConverter;
pub use pipe::PipeConverter;
pub use scanner::{Copied, DelimiterScanner, Scan, copy_until, copy_until_async};
pub use service::{ServiceConverter, encode_markup};
