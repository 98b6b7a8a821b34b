//! Internal constants for engine conversion.

use std::time::Duration;

/// Default per-conversion timeout (60 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default loopback address for the engine service.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default first port for the engine service.
pub const DEFAULT_PORT: u16 = 16395;

/// Default render type for the engine service.
pub const DEFAULT_RENDER_TYPE: &str = "png";

/// Default time allowed for the engine service to start listening.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Time an engine gets to exit on its own during disposal before it is killed.
pub(crate) const DISPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness checks of a starting engine service.
pub(crate) const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Line separator the engine writes after each delimiter.
#[cfg(windows)]
pub(crate) const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub(crate) const LINE_SEPARATOR: &str = "\n";
