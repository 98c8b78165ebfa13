//! Shared HTTP client configuration.
//!
//! Provides pre-configured HTTP clients with appropriate timeouts for
//! different use cases (regular provider calls vs. streaming completions).
//! All Provider Gateway calls should go through these builders so timeout
//! behavior and connection pooling stay consistent across providers.

use std::time::Duration;

/// Connect timeout in seconds (time to establish the TCP connection).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Request timeout for regular (non-streaming) requests, in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Request timeout for streaming requests, in seconds (longer for SSE).
pub const STREAMING_TIMEOUT_SECS: u64 = 300;

/// Build an HTTP client for regular (non-streaming) provider requests.
pub fn provider_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .expect("Failed to build HTTP client")
}

/// Build an HTTP client for streaming provider requests (SSE).
///
/// Uses a longer timeout to accommodate long agent tool loops that may
/// take several minutes to finish streaming.
pub fn streaming_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(STREAMING_TIMEOUT_SECS))
        .build()
        .expect("Failed to build streaming HTTP client")
}
