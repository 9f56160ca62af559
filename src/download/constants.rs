//! Constants for the download module (parallelism, timeouts, file naming).

use std::time::Duration;

/// Default number of transfers allowed to run at the same time.
pub const DEFAULT_PARALLELISM: usize = 3;

/// Smallest accepted parallelism value.
pub const MIN_PARALLELISM: usize = 1;

/// Largest accepted parallelism value.
pub const MAX_PARALLELISM: usize = 64;

/// Default time allowed for a request to produce response headers (15 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default overall read timeout for the HTTP client (5 minutes for large files).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Default progress step, in percentage points, between two progress events.
pub const DEFAULT_PROGRESS_STEP: u8 = 1;

/// Extension used for in-flight (temporary) download files.
pub const TEMP_EXTENSION: &str = "temp";

/// Longest extension carried over from a download key to its final file.
pub const MAX_EXTENSION_LEN: usize = 16;
