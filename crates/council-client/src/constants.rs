//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default council server (the `council watch` web server).
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// Interval between incremental polls, independent of round-trip time.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How long `wait_for_turn` blocks when the caller gives no timeout.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Config file name under `$XDG_CONFIG_HOME/council/`.
pub const CONFIG_FILE_NAME: &str = "client.ron";
