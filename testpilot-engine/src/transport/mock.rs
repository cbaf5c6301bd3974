//! Mock-HTTP transport
//!
//! Replays a built curl command as a plain HTTP request against the embedded
//! mock server, then synthesizes a curl-style verbose trace so the response
//! parser sees the same shape production runs produce. Keeps hermetic runs
//! free of curl/ssh dependencies.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use testpilot_common::{Error, HttpMethod, Result};

use crate::config::Host;
use crate::curl_parse::parse_curl_command;

use super::{CommandOutput, Transport};

pub struct MockTransport {
    client: reqwest::Client,
}

impl MockTransport {
    pub fn new(_base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, command: &str, _host: &Host) -> Result<CommandOutput> {
        let parsed = parse_curl_command(command)
            .map_err(|e| Error::transport(format!("Mock transport cannot replay command: {e}")))?;
        debug!(method = %parsed.method, url = %parsed.url, "mock request");

        let started = Instant::now();
        let mut request = self
            .client
            .request(to_reqwest_method(parsed.method), &parsed.url);
        for (name, value) in &parsed.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &parsed.payload {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(format!("Mock server unreachable: {e}")))?;

        let status = response.status().as_u16();
        // Rebuild the verbose trace the parser expects
        let mut stderr = format!("< HTTP/2 {status} \r\n");
        for (name, value) in response.headers() {
            stderr.push_str(&format!(
                "< {}: {}\r\n",
                name.as_str(),
                value.to_str().unwrap_or("")
            ));
        }
        stderr.push_str("<\r\n");

        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("Mock response body unreadable: {e}")))?;

        Ok(CommandOutput {
            stdout: body,
            stderr,
            exit_code: 0,
            duration: started.elapsed(),
        })
    }
}
