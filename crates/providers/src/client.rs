use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Timeout for availability probes against local servers.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a `reqwest::Client` with the given request timeout.
///
/// Proxy handling is left to reqwest, which reads `HTTPS_PROXY`/`HTTP_PROXY` itself.
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// First `max_chars` characters of a response body, cut on a char boundary.
pub(crate) fn preview(body: &str, max_chars: usize) -> &str {
    let end = body
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

pub(crate) fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
