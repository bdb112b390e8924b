//! Device Client
//!
//! Speaks the JSON-over-HTTP control API: `POST http://<addr>:<port>/` with a
//! body of `{"command": "<name>"}`. Every failure mode comes back as a
//! [`ProbeFailure`] and is logged at trace level only, because the vast
//! majority of swept addresses are not devices.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{instrument, trace};

use crate::config::ClientConfig;
use crate::domain::ports::{Command, DeviceApi, ProbeFailure, ProbeResult};
use crate::error::{Error, Result};

/// Largest response body accepted from a device. Real payloads are a few KiB.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// HTTP client for the device control API.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    config: ClientConfig,
    client: Client,
}

impl DeviceClient {
    /// Create a new device client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .no_proxy()
            .build()
            .map_err(Error::Http)?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// URL of a device's control endpoint.
    pub fn endpoint(&self, address: Ipv4Addr) -> String {
        format!("http://{}:{}/", address, self.config.api_port)
    }
}

#[async_trait]
impl DeviceApi for DeviceClient {
    #[instrument(level = "trace", skip(self))]
    async fn execute(&self, address: Ipv4Addr, command: Command) -> ProbeResult {
        let mut response = self
            .client
            .post(self.endpoint(address))
            .json(&json!({ "command": command.as_str() }))
            .send()
            .await
            .map_err(|e| {
                let failure = classify(&e);
                trace!("{} {} failed: {}", address, command, failure);
                failure
            })?;

        let status = response.status();
        if !status.is_success() {
            trace!("{} {} returned {}", address, command, status);
            return Err(ProbeFailure::Status(status.as_u16()));
        }

        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
        {
            trace!("{} {} announced an oversized body", address, command);
            return Err(ProbeFailure::TooLarge(MAX_RESPONSE_BYTES));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(&e))? {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                trace!("{} {} streamed an oversized body", address, command);
                return Err(ProbeFailure::TooLarge(MAX_RESPONSE_BYTES));
            }
            body.extend_from_slice(&chunk);
        }
        decode_body(&body)
    }
}

fn classify(e: &reqwest::Error) -> ProbeFailure {
    if e.is_timeout() {
        ProbeFailure::Timeout
    } else if e.is_connect() {
        ProbeFailure::Connect
    } else if e.is_decode() {
        ProbeFailure::Decode(e.to_string())
    } else {
        ProbeFailure::Transport(e.to_string())
    }
}

/// Parse a response body. Firmware commonly pads the JSON with NUL bytes.
pub(crate) fn decode_body(body: &[u8]) -> ProbeResult {
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map_or(0, |i| i + 1);

    serde_json::from_slice::<Value>(&body[..end]).map_err(|e| ProbeFailure::Decode(e.to_string()))
}
