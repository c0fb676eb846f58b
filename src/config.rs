//! Transport configuration.
//!
//! Configuration is a flat set of numeric knobs. It can be built from a
//! `key=value` string (tokens separated by `;` or whitespace, unknown keys
//! and malformed values ignored) and is seeded from the environment at
//! construction time.

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default write-queue byte budget (2 MiB).
pub const DEFAULT_WRITE_QUEUE_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Environment variable overriding the default request timeout.
pub const TIMEOUT_ENV_VAR: &str = "MCP_STDIOTRANSPORT_TIMEOUT_MS";

/// Tunable knobs for a [`StdioTransport`](crate::transport::StdioTransport).
///
/// A timeout of `0` disables that feature. `write_queue_max_bytes` is
/// clamped to at least 1 when applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Per-request deadline in milliseconds; 0 disables.
    pub request_timeout_ms: u64,
    /// Abort the transport when no bytes arrive for this long; 0 disables.
    pub idle_read_timeout_ms: u64,
    /// Per-frame write deadline in milliseconds; 0 disables.
    pub write_timeout_ms: u64,
    /// Byte budget for the outbound queue.
    pub write_queue_max_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_read_timeout_ms: 0,
            write_timeout_ms: 0,
            write_queue_max_bytes: DEFAULT_WRITE_QUEUE_MAX_BYTES,
        }
    }
}

impl TransportConfig {
    /// Defaults with the `MCP_STDIOTRANSPORT_TIMEOUT_MS` override applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let env = env_or_default(TIMEOUT_ENV_VAR, "");
        if !env.is_empty() {
            if let Ok(value) = env.parse::<u64>() {
                config.request_timeout_ms = value;
            }
        }
        config
    }

    /// Parse a `key=value` configuration string on top of [`from_env`](Self::from_env).
    ///
    /// Recognized keys: `timeout_ms`, `idle_read_timeout_ms`,
    /// `write_timeout_ms`, `write_queue_max_bytes`.
    pub fn parse(config: &str) -> Self {
        let mut out = Self::from_env();
        for token in config
            .split(|c| c == ';' || c == ' ' || c == '\t')
            .filter(|t| !t.is_empty())
        {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "timeout_ms" => {
                    if let Ok(v) = value.parse::<u64>() {
                        out.request_timeout_ms = v;
                    }
                }
                "idle_read_timeout_ms" => {
                    if let Ok(v) = value.parse::<u64>() {
                        out.idle_read_timeout_ms = v;
                    }
                }
                "write_timeout_ms" => {
                    if let Ok(v) = value.parse::<u64>() {
                        out.write_timeout_ms = v;
                    }
                }
                "write_queue_max_bytes" => {
                    if let Ok(v) = value.parse::<usize>() {
                        out.write_queue_max_bytes = v;
                    }
                }
                _ => {}
            }
        }
        out
    }
}

/// Read an environment variable, falling back to `default` when unset or
/// not valid Unicode.
pub(crate) fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
