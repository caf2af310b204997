//! Remote backend behaviour over a canned HTTP transport.

use advlm::config::CREDENTIAL_ENV_VAR;
use advlm::testing::CannedTransport;
use advlm::{
    Backend, BackendConfig, BackendError, BackendKind, CommandResolver, RemoteBackend,
    ResolverMode, create_backend,
};
use wordtok::DictionaryBuilder;

fn remote_config() -> BackendConfig {
    BackendConfig {
        endpoint_url: "https://llm.invalid/v1/chat/completions".into(),
        model_identifier: "small-chat".into(),
        ..BackendConfig::for_backend(BackendKind::Remote)
    }
}

fn resolver<'d>(mode: ResolverMode, transport: &CannedTransport) -> CommandResolver<'d> {
    let backend = RemoteBackend::with_transport(
        &remote_config(),
        "sk-test".into(),
        Box::new(transport.clone()),
    );
    CommandResolver::new(Box::new(backend), mode)
}

fn body(transport: &CannedTransport, index: usize) -> serde_json::Value {
    serde_json::from_str(&transport.requests()[index].body).unwrap()
}

#[test]
fn test_extraction_round_trip() {
    let transport = CannedTransport::new();
    transport.reply_content("Look Castle\nExplanation: ...");
    let mut resolver = resolver(ResolverMode::Extraction, &transport);

    assert_eq!(resolver.extract_words("mira el castillo"), "look castle");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://llm.invalid/v1/chat/completions");
    assert_eq!(requests[0].credential, "sk-test");
    let body = body(&transport, 0);
    assert_eq!(body["model"], "small-chat");
    assert_eq!(body["max_tokens"], 10);
    let prompt = body["messages"][0]["content"].as_str().unwrap();
    assert!(prompt.ends_with("User: Translate to English (verb noun only):\nmira el castillo\nAssistant:"));
}

#[test]
fn test_semantic_match_over_http() {
    let transport = CannedTransport::new();
    transport.reply_content("yes").reply_content("No, different action.");
    let mut resolver = resolver(ResolverMode::Semantic, &transport);

    let mut builder = DictionaryBuilder::new();
    builder.insert("look", 10).unwrap();
    builder.insert("castle", 25).unwrap();
    let words = builder.build().unwrap();
    resolver.set_dictionary(&words).unwrap();

    assert!(resolver.matches_expected("observa el castillo", &[10, 25]));
    assert!(!resolver.matches_expected("salir", &[10, 25]));
    assert_eq!(body(&transport, 0)["max_tokens"], 5);
}

#[test]
fn test_failures_fall_back() {
    let transport = CannedTransport::new();
    transport
        .fail("connection refused")
        .reply(r#"{"error":{"message":"invalid key"}}"#);
    let mut resolver = resolver(ResolverMode::Extraction, &transport);

    assert_eq!(resolver.extract_words("coge la llave"), "coge la llave");
    assert_eq!(resolver.extract_words("abre la puerta"), "abre la puerta");
    assert_eq!(transport.requests().len(), 2);
}

#[test]
fn test_response_uses_detected_language() {
    let transport = CannedTransport::new();
    transport
        .reply_content("French.")
        .reply_content("  Vous voyez un château.  ");
    let mut resolver = resolver(ResolverMode::Extraction, &transport);

    let text = resolver.generate_response("You see a castle.", "regarde le château");
    assert_eq!(text.as_deref(), Some("Vous voyez un château."));

    let narrator = body(&transport, 1);
    assert_eq!(narrator["max_tokens"], 150);
    assert!(
        narrator["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("into French")
    );
}

#[test]
fn test_missing_credential_fails_initialization() {
    if std::env::var(CREDENTIAL_ENV_VAR).is_ok() {
        eprintln!("Skipping: {} is set", CREDENTIAL_ENV_VAR);
        return;
    }
    let config = BackendConfig {
        credential: None,
        ..remote_config()
    };
    assert!(matches!(
        RemoteBackend::initialize(&config).err(),
        Some(BackendError::MissingCredential { .. })
    ));
    assert!(create_backend(&config).is_err());
    assert!(CommandResolver::from_config(&config).is_err());
}
