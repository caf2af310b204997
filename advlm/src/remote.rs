//! Chat-completion client for the remote backend.
//!
//! Every call is a fresh, stateless HTTP request; there is no attention cache
//! to manage, so slot choices are ignored.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::BackendConfig;
use crate::error::{BackendError, GenerationError};
use crate::sampler::{SamplerKind, creative_temperature};
use crate::session::{Completion, CompletionRequest};

/// Request body of the chat-completion API.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Moves one JSON body to the endpoint and returns the raw response body.
pub trait Transport: Send {
    fn post_json(&mut self, url: &str, credential: &str, body: String) -> Result<String>;
}

/// Blocking HTTPS transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client. `timeout` of `None` waits indefinitely.
    pub fn new(timeout: Option<Duration>) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json(&mut self, url: &str, credential: &str, body: String) -> Result<String> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {credential}"))
            .body(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        let text = response.text().context("Failed to read response body")?;
        if !status.is_success() {
            anyhow::bail!("HTTP {}: {}", status, text.chars().take(200).collect::<String>());
        }
        Ok(text)
    }
}

/// Remote completion client.
pub struct RemoteClient {
    transport: Box<dyn Transport>,
    endpoint: String,
    credential: String,
    model: String,
    temperature: f64,
    creative_temperature: f64,
    log_level: log::Level,
}

impl RemoteClient {
    /// Build a client from config. The credential must already be resolved.
    pub fn new(config: &BackendConfig, credential: String, transport: Box<dyn Transport>) -> Self {
        let creative = if config.creative_sampling {
            creative_temperature(
                config.temperature_creative_base,
                config.temperature_creative_offset,
                &mut rand::thread_rng(),
            )
        } else {
            config.temperature
        };
        log::info!(
            "Remote completion client: {} (model {}, creative temperature {:.3})",
            config.endpoint_url,
            config.model_identifier,
            creative
        );
        Self {
            transport,
            endpoint: config.endpoint_url.clone(),
            credential,
            model: config.model_identifier.clone(),
            temperature: config.temperature,
            creative_temperature: creative,
            log_level: config.prompt_log_level(),
        }
    }

    fn request_body(&self, request: &CompletionRequest<'_>) -> Result<String, GenerationError> {
        let temperature = match request.sampler {
            SamplerKind::Deterministic => self.temperature,
            SamplerKind::Creative => self.creative_temperature,
        };
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: request.prompt,
            }],
            temperature,
            max_tokens: request.max_tokens,
        };
        serde_json::to_string(&body).map_err(|e| GenerationError::Transport(e.to_string()))
    }
}

impl Completion for RemoteClient {
    fn complete(&mut self, request: &CompletionRequest<'_>) -> Result<String, GenerationError> {
        log::log!(
            self.log_level,
            "=== REMOTE PROMPT ({} chars) ===\n{}\n=== END ===",
            request.prompt.len(),
            request.prompt
        );
        let body = self.request_body(request)?;
        let response = self
            .transport
            .post_json(&self.endpoint, &self.credential, body)
            .map_err(|e| GenerationError::Transport(format!("{e:#}")))?;
        let mut text = extract_content(&response).ok_or(GenerationError::MissingContent)?;

        // The server cannot stop mid-generation; cut after the first newline.
        if request.stop_at_newline {
            if let Some(idx) = text.find('\n') {
                text.truncate(idx + 1);
            }
        }
        log::log!(self.log_level, "=== REMOTE OUTPUT ===\n{}\n=== END ===", text);
        Ok(text)
    }
}

/// Pull the first `"content":"..."` string out of a response body.
///
/// Only `\n \r \t \" \\` are translated; any other escaped character is kept
/// as itself. Returns `None` when the field is missing.
pub fn extract_content(body: &str) -> Option<String> {
    const KEY: &str = "\"content\":\"";
    let start = body.find(KEY)? + KEY.len();

    let mut out = String::new();
    let mut chars = body[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
    // Unterminated string: keep what was read.
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::testing::CannedTransport;

    fn client(transport: &CannedTransport) -> RemoteClient {
        let config = BackendConfig {
            model_identifier: "test-model".into(),
            endpoint_url: "https://llm.invalid/v1/chat/completions".into(),
            ..BackendConfig::for_backend(BackendKind::Remote)
        };
        RemoteClient::new(&config, "sk-test".into(), Box::new(transport.clone()))
    }

    #[test]
    fn test_extract_content_unescapes() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"look\tcastle\n\"ok\" \\ \/"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "look\tcastle\n\"ok\" \\ /");
    }

    #[test]
    fn test_extract_content_missing() {
        assert_eq!(extract_content(r#"{"error":{"message":"bad key"}}"#), None);
        // With a space after the colon the field is not recognised.
        assert_eq!(extract_content(r#"{"content": "x"}"#), None);
    }

    #[test]
    fn test_request_payload_shape() {
        let transport = CannedTransport::new();
        transport.reply_content("look castle");
        let mut remote = client(&transport);

        let text = remote
            .complete(&CompletionRequest::deterministic("mira el castillo", 10))
            .unwrap();
        assert_eq!(text, "look castle");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].credential, "sk-test");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "mira el castillo");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn test_newline_stop_truncates() {
        let transport = CannedTransport::new();
        transport.reply_content("look castle\nand more");
        let mut remote = client(&transport);
        let text = remote
            .complete(&CompletionRequest::deterministic("p", 10))
            .unwrap();
        assert_eq!(text, "look castle\n");
    }

    #[test]
    fn test_transport_failure_is_generation_error() {
        let transport = CannedTransport::new();
        transport.fail("connection refused");
        let mut remote = client(&transport);
        let err = remote
            .complete(&CompletionRequest::deterministic("p", 10))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transport(msg) if msg.contains("connection refused")));
    }
}
