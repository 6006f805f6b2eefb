//! Shared request plumbing for the OpenAI-compatible clients.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub(crate) const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub(crate) fn build_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Read the API key from `env_var`.
///
/// The hosted endpoint always needs a key; self-hosted compatible servers
/// often do not, so a missing key is only an error for the former.
pub(crate) fn api_key(env_var: &str, base_url: &str) -> Result<Option<String>> {
    let key = std::env::var(env_var).ok().filter(|k| !k.trim().is_empty());
    if key.is_none() && is_hosted(base_url) {
        return Err(Error::Config(format!(
            "{env_var} is not set; it is required for {base_url}"
        )));
    }
    Ok(key)
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

fn is_hosted(base_url: &str) -> bool {
    base_url
        .trim_end_matches('/')
        .starts_with(OPENAI_BASE_URL.trim_end_matches("/v1"))
}

/// POST a JSON body, retrying rate limits, server errors and network
/// failures with exponential backoff (1s, 2s, 4s, ...). Other client
/// errors fail immediately. `fail` wraps the final error message.
pub(crate) fn post_json(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    fail: fn(String) -> Error,
) -> Result<Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, url, "retrying request");
            std::thread::sleep(delay);
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        match request.send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let text = response.text().unwrap_or_default();
                let message = format!("{url} returned {status}: {text}");
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(attempt, %status, "transient API error");
                    last_err = Some(message);
                    continue;
                }
                return Err(fail(message));
            }
            Err(e) => {
                warn!(attempt, error = %e, "request failed");
                last_err = Some(format!("request to {url} failed: {e}"));
            }
        }
    }

    Err(fail(last_err.unwrap_or_else(|| {
        format!("request to {url} failed after {max_retries} retries")
    })))
}
