//! End-to-end authentication flows through the listener façade.

mod common;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::StatusCode;

use authq::auth::provider::{DigestStep, Principal, SecurityStatus, TokenStep};
use authq::auth::spn::{ExtendedProtectionPolicy, PolicyEnforcement};
use authq::{AuthConfig, AuthListener};

use common::{init_logging, request, RecordingTransport, ScriptedProvider};

fn config(schemes: &[&str], realm: &str) -> AuthConfig {
    AuthConfig {
        schemes: schemes.iter().map(|s| s.to_string()).collect(),
        realm: realm.to_string(),
        ..AuthConfig::default()
    }
}

fn started_listener(
    config: AuthConfig,
    provider: &Arc<ScriptedProvider>,
    transport: &Arc<RecordingTransport>,
) -> AuthListener {
    init_logging();
    let provider: Arc<ScriptedProvider> = Arc::clone(provider);
    let transport: Arc<RecordingTransport> = Arc::clone(transport);
    let listener = AuthListener::new(config, provider, transport).unwrap();
    listener.start().unwrap();
    listener
}

#[test]
fn challenge_list_covers_all_allowed_schemes() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["negotiate", "basic"], "R"), &provider, &transport);

    let handed_off = listener.handle_request(&request(1, 1, None)).unwrap();
    assert!(handed_off.is_none());

    let (request_id, status, challenges) = transport.last_response().unwrap();
    assert_eq!(request_id, 1);
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges, vec!["Negotiate".to_string(), "Basic realm=\"R\"".to_string()]);
}

#[test]
fn basic_round_trip() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["basic"], "test"), &provider, &transport);

    // First request carries no credentials and gets the realm challenge.
    assert!(listener.handle_request(&request(1, 1, None)).unwrap().is_none());
    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges, vec!["Basic realm=\"test\"".to_string()]);

    // Retry with base64("alice:secret").
    let accepted = listener
        .handle_request(&request(1, 2, Some("Basic YWxpY2U6c2VjcmV0")))
        .unwrap()
        .expect("credentials should be accepted");
    let principal = accepted.principal.expect("identity expected");
    assert_eq!(principal.name, "alice");
    assert_eq!(principal.auth_type, "Basic");
    assert_eq!(principal.password.as_deref(), Some("secret"));
}

#[test]
fn basic_credentials_without_delimiter_are_a_client_error() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["basic"], "test"), &provider, &transport);

    let blob = STANDARD.encode("nodelimiter");
    let header = format!("Basic {blob}");
    assert!(listener
        .handle_request(&request(1, 1, Some(&header)))
        .unwrap()
        .is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(challenges.is_empty());
}

#[test]
fn malformed_base64_rejects_without_creating_a_context() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["negotiate"], ""), &provider, &transport);

    assert!(listener
        .handle_request(&request(1, 1, Some("Negotiate not-valid-base64!!")))
        .unwrap()
        .is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(challenges.is_empty());
    assert_eq!(provider.created_count(), 0);
}

#[test]
fn ntlm_handshake_continues_then_completes_on_one_context() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["ntlm"], ""), &provider, &transport);

    provider.push_token_step(TokenStep {
        output: Some(b"server-challenge".to_vec()),
        status: SecurityStatus::ContinueNeeded,
        complete: false,
    });
    let type1 = format!("NTLM {}", STANDARD.encode(b"type1"));
    assert!(listener.handle_request(&request(7, 1, Some(&type1))).unwrap().is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        challenges,
        vec![format!("NTLM {}", STANDARD.encode(b"server-challenge"))]
    );

    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_identity(Principal {
        name: "CORP\\alice".to_string(),
        auth_type: "NTLM".to_string(),
        password: None,
    });
    let type3 = format!("NTLM {}", STANDARD.encode(b"type3"));
    let accepted = listener
        .handle_request(&request(7, 2, Some(&type3)))
        .unwrap()
        .expect("handshake completion should be accepted");
    assert_eq!(accepted.principal.unwrap().name, "CORP\\alice");

    // The second round reused the retained session instead of starting over.
    assert_eq!(provider.created_count(), 1);
    assert!(provider.all_released_once());
}

#[test]
fn completed_negotiate_carries_mutual_challenge() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["negotiate"], ""), &provider, &transport);

    provider.push_token_step(TokenStep {
        output: Some(b"mutual-proof".to_vec()),
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_protocol("Kerberos");
    provider.set_identity(Principal {
        name: "alice@EXAMPLE.COM".to_string(),
        auth_type: "Kerberos".to_string(),
        password: None,
    });

    let header = format!("Negotiate {}", STANDARD.encode(b"ticket"));
    let accepted = listener
        .handle_request(&request(1, 1, Some(&header)))
        .unwrap()
        .expect("kerberos ticket should be accepted");
    assert_eq!(
        accepted.mutual_challenge,
        Some(format!("Negotiate {}", STANDARD.encode(b"mutual-proof")))
    );
}

#[test]
fn unsafe_ntlm_identity_is_reused_until_client_reauthenticates() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let mut cfg = config(&["ntlm"], "");
    cfg.unsafe_connection_ntlm_auth = true;
    let listener = started_listener(cfg, &provider, &transport);

    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_identity(Principal {
        name: "CORP\\bob".to_string(),
        auth_type: "NTLM".to_string(),
        password: None,
    });
    let header = format!("NTLM {}", STANDARD.encode(b"type3"));
    let first = listener
        .handle_request(&request(9, 1, Some(&header)))
        .unwrap()
        .expect("handshake should complete");
    assert_eq!(first.principal.unwrap().name, "CORP\\bob");
    let handshake_calls = provider.accept_calls();

    // Header-less request on the same connection rides the cached identity.
    let second = listener
        .handle_request(&request(9, 2, None))
        .unwrap()
        .expect("cached identity should be reused");
    assert_eq!(second.principal.unwrap().name, "CORP\\bob");
    assert_eq!(provider.accept_calls(), handshake_calls);

    // An explicit re-authentication drops the cached identity first; with a
    // failing handshake the connection is no longer authenticated.
    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::LogonDenied,
        complete: false,
    });
    assert!(listener.handle_request(&request(9, 3, Some(&header))).unwrap().is_none());
    let (_, status, _) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(listener.handle_request(&request(9, 4, None)).unwrap().is_none());
    let (_, status, _) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[test]
fn spn_mismatch_denies_with_rebuilt_challenge() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let mut cfg = config(&["ntlm"], "");
    cfg.extended_protection = ExtendedProtectionPolicy {
        enforcement: PolicyEnforcement::Always,
        ..ExtendedProtectionPolicy::default()
    };
    cfg.service_names = vec!["HTTP/server.example.com".to_string()];
    let listener = started_listener(cfg, &provider, &transport);

    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_target_name(Some("HTTP/spoofed.example.com"));
    provider.set_identity(Principal {
        name: "CORP\\mallory".to_string(),
        auth_type: "NTLM".to_string(),
        password: None,
    });

    let header = format!("NTLM {}", STANDARD.encode(b"type3"));
    assert!(listener.handle_request(&request(4, 1, Some(&header))).unwrap().is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges, vec!["NTLM".to_string()]);
    assert!(provider.all_released_once());
}

#[test]
fn digest_spn_mismatch_rebuilds_a_fresh_challenge() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let mut cfg = config(&["digest"], "d");
    cfg.extended_protection = ExtendedProtectionPolicy {
        enforcement: PolicyEnforcement::Always,
        ..ExtendedProtectionPolicy::default()
    };
    cfg.service_names = vec!["HTTP/server.example.com".to_string()];
    let listener = started_listener(cfg, &provider, &transport);

    provider.push_digest_step(DigestStep {
        output: None,
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_target_name(Some("HTTP/spoofed.example.com"));
    provider.set_identity(Principal {
        name: "mallory".to_string(),
        auth_type: "WDigest".to_string(),
        password: None,
    });

    let header = "Digest username=\"mallory\", nonce=\"abc\"";
    assert!(listener.handle_request(&request(5, 1, Some(header))).unwrap().is_none());

    // The denial is a 401 carrying a freshly built Digest challenge; the
    // denied context moved to the cache instead of blocking the rebuild.
    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges.len(), 1);
    assert!(challenges[0].starts_with("Digest "));
    assert_eq!(provider.created_count(), 2);

    listener.stop().unwrap();
    assert!(provider.all_released_once());
}

#[test]
fn invalid_handle_on_the_first_token_is_a_client_error() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["ntlm"], ""), &provider, &transport);

    // First token on the connection: the ambiguous handle status really
    // means the token was unacceptable.
    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::InvalidHandle,
        complete: false,
    });
    let header = format!("NTLM {}", STANDARD.encode(b"garbage"));
    assert!(listener.handle_request(&request(1, 1, Some(&header))).unwrap().is_none());
    let (_, status, _) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // With a session already attached the status is taken at face value.
    provider.push_token_step(TokenStep {
        output: Some(b"server-challenge".to_vec()),
        status: SecurityStatus::ContinueNeeded,
        complete: false,
    });
    assert!(listener.handle_request(&request(2, 2, Some(&header))).unwrap().is_none());
    provider.push_token_step(TokenStep {
        output: None,
        status: SecurityStatus::InvalidHandle,
        complete: false,
    });
    assert!(listener.handle_request(&request(2, 3, Some(&header))).unwrap().is_none());
    let (_, status, _) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn digest_success_discards_the_leftover_output_buffer() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["digest"], "d"), &provider, &transport);

    // The provider answers success but still fills the output buffer; the
    // status wins and nothing from the buffer reaches the client.
    provider.push_digest_step(DigestStep {
        output: Some("stale=\"state\"".to_string()),
        status: SecurityStatus::Ok,
        complete: true,
    });
    provider.set_identity(Principal {
        name: "alice".to_string(),
        auth_type: "WDigest".to_string(),
        password: None,
    });

    let header = "Digest username=\"alice\", nonce=\"abc\"";
    let accepted = listener
        .handle_request(&request(3, 1, Some(header)))
        .unwrap()
        .expect("completed digest handshake should be accepted");
    assert_eq!(accepted.principal.unwrap().name, "alice");
    assert!(accepted.mutual_challenge.is_none());
    assert!(transport.responses().is_empty());
}

#[test]
fn challenge_headers_for_a_delivered_request_cache_the_digest_state() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["digest", "basic"], "d"), &provider, &transport);

    let headers = listener.challenge_headers_for(&request(1, 1, None));
    assert_eq!(headers.len(), 2);
    assert!(headers[0].starts_with("Digest "));
    assert_eq!(headers[1], "Basic realm=\"d\"".to_string());

    // The digest state behind the challenge is cached, not attached to the
    // connection: no disconnect wait was registered.
    assert_eq!(transport.pending_disconnects(), 0);
    assert_eq!(provider.created_count(), 1);

    listener.stop().unwrap();
    assert!(provider.all_released_once());
}

#[test]
fn scheme_selector_failure_maps_to_server_error() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let mut listener = AuthListener::new(
        config(&["basic"], "r"),
        provider.clone(),
        transport.clone(),
    )
    .unwrap();
    listener.set_scheme_selector(Box::new(|_| Err("selector blew up".into())));
    listener.start().unwrap();

    assert!(listener
        .handle_request(&request(1, 1, Some("Basic YWxpY2U6c2VjcmV0")))
        .unwrap()
        .is_none());
    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(challenges.is_empty());
}

#[test]
fn anonymous_requests_pass_when_allowed() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["anonymous"], ""), &provider, &transport);

    let accepted = listener
        .handle_request(&request(1, 1, None))
        .unwrap()
        .expect("anonymous should be accepted");
    assert!(accepted.principal.is_none());
    assert!(transport.responses().is_empty());
}

#[test]
fn anonymous_disallowed_without_challenges_is_forbidden() {
    // An unknown scheme set at runtime: selector narrows to nothing.
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let mut listener = AuthListener::new(
        config(&["basic"], "r"),
        provider.clone(),
        transport.clone(),
    )
    .unwrap();
    listener.set_scheme_selector(Box::new(|_| Ok(authq::auth::SchemeSet::NONE)));
    listener.start().unwrap();

    assert!(listener.handle_request(&request(1, 1, None)).unwrap().is_none());
    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(challenges.is_empty());
}

#[test]
fn disconnect_registration_failure_fails_closed() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["ntlm"], ""), &provider, &transport);
    transport.set_fail_registration(true);

    provider.push_token_step(TokenStep {
        output: Some(b"server-challenge".to_vec()),
        status: SecurityStatus::ContinueNeeded,
        complete: false,
    });
    let header = format!("NTLM {}", STANDARD.encode(b"type1"));
    assert!(listener.handle_request(&request(2, 1, Some(&header))).unwrap().is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(challenges.is_empty());
    // The would-be session must not leak.
    assert!(provider.all_released_once());
}

#[test]
fn digest_challenge_is_offered_with_provider_state() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["digest"], "d"), &provider, &transport);

    provider.push_digest_step(DigestStep {
        output: Some("qop=\"auth\", nonce=\"abc123\"".to_string()),
        status: SecurityStatus::ContinueNeeded,
        complete: false,
    });
    assert!(listener.handle_request(&request(3, 1, None)).unwrap().is_none());

    let (_, status, challenges) = transport.last_response().unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenges, vec!["Digest qop=\"auth\", nonce=\"abc123\"".to_string()]);
    // The challenge's context became the connection's session, tracked for
    // disconnect.
    assert_eq!(transport.pending_disconnects(), 1);
}

#[test]
fn send_failure_cancels_the_request() {
    let provider = ScriptedProvider::new();
    let transport = RecordingTransport::new();
    let listener = started_listener(config(&["basic"], "r"), &provider, &transport);
    transport.set_fail_send(true);

    assert!(listener.handle_request(&request(1, 42, None)).unwrap().is_none());
    assert_eq!(transport.canceled(), vec![42]);
}
