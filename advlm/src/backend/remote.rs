//! Hosted chat-completion backend.

use std::time::Duration;

use crate::backend::{Backend, BackendCore};
use crate::config::{BackendConfig, BackendKind};
use crate::error::BackendError;
use crate::remote::{HttpTransport, RemoteClient, Transport};

pub struct RemoteBackend {
    core: BackendCore<RemoteClient>,
}

impl RemoteBackend {
    /// Build over a caller-supplied transport. `credential` is used as given.
    pub fn with_transport(
        config: &BackendConfig,
        credential: String,
        transport: Box<dyn Transport>,
    ) -> Self {
        let client = RemoteClient::new(config, credential, transport);
        Self {
            core: BackendCore::new(BackendKind::Remote, client, config),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.completion().is_some()
    }
}

impl Backend for RemoteBackend {
    fn initialize(config: &BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let credential = config.resolve_credential()?;
        let transport = HttpTransport::new(config.request_timeout_secs.map(Duration::from_secs))?;
        Ok(Self::with_transport(config, credential, Box::new(transport)))
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }

    fn extract_canonical(&mut self, input: &str, vocabulary_hint: Option<&str>) -> String {
        self.core.extract_canonical(input, vocabulary_hint)
    }

    fn matches(&mut self, input: &str, expected_words: &[String]) -> bool {
        self.core.matches(input, expected_words)
    }

    fn generate_response(
        &mut self,
        game_text: &str,
        user_text: &str,
        context: Option<&str>,
    ) -> Option<String> {
        self.core.generate_response(game_text, user_text, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CannedTransport;

    fn backend(transport: &CannedTransport) -> RemoteBackend {
        let config = BackendConfig::for_backend(BackendKind::Remote);
        RemoteBackend::with_transport(&config, "sk-test".into(), Box::new(transport.clone()))
    }

    #[test]
    fn test_configured_credential_initializes() {
        let config = BackendConfig {
            credential: Some("sk-config".into()),
            request_timeout_secs: Some(5),
            ..BackendConfig::for_backend(BackendKind::Remote)
        };
        let backend = RemoteBackend::initialize(&config).unwrap();
        assert!(backend.is_connected());
    }

    #[test]
    fn test_error_reply_falls_back() {
        let transport = CannedTransport::new();
        transport.reply(r#"{"error":{"message":"rate limited"}}"#).fail("timeout");
        let mut remote = backend(&transport);
        assert_eq!(remote.extract_canonical("mira el castillo", None), "mira el castillo");
        assert!(!remote.matches("mira el castillo", &["look".into()]));
    }

    #[test]
    fn test_shutdown_stops_requests() {
        let transport = CannedTransport::new();
        let mut remote = backend(&transport);
        remote.shutdown();
        assert!(!remote.is_connected());
        assert_eq!(remote.generate_response("Hello.", "hola", None), None);
        assert!(transport.requests().is_empty());
    }
}
