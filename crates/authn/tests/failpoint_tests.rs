#![cfg(feature = "failpoints")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the authn crate.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p castellan-authn --features failpoints --test failpoint_tests
//! ```

use std::sync::Arc;

use castellan_authn::{
    Authenticator, RemoteRequestHeadersAuthenticator, testutil::MockAuthenticationBackend,
};
use castellan_cache::RequestContext;
use http::{HeaderMap, HeaderValue};
use serde_json::json;
use tonic::Code;

fn setup() -> (RemoteRequestHeadersAuthenticator, Arc<MockAuthenticationBackend>, HeaderMap) {
    let backend = Arc::new(MockAuthenticationBackend::allow(json!({"public": {"user": "alice"}}), None));
    let authenticator = RemoteRequestHeadersAuthenticator::builder()
        .backend(backend.clone())
        .header_keys(vec!["authorization".to_owned()])
        .build()
        .expect("failed to build authenticator");
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer token"));
    (authenticator, backend, headers)
}

#[tokio::test]
async fn remote_authn_failpoint_returns_unavailable() {
    let scenario = fail::FailScenario::setup();
    let (authenticator, backend, headers) = setup();

    // Enable fail point: the RPC is never attempted
    fail::cfg("remote-authn-before-rpc", "return").expect("failed to configure fail point");

    let err = authenticator.authenticate(&RequestContext::new(), &headers).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(backend.calls(), 0);
    assert_eq!(authenticator.stats().entries, 0, "failures must not be cached");

    fail::remove("remote-authn-before-rpc");
    let metadata = authenticator.authenticate(&RequestContext::new(), &headers).await;
    assert!(metadata.is_ok(), "request should succeed once the fail point is removed");
    assert_eq!(backend.calls(), 1);

    scenario.teardown();
}

#[tokio::test]
async fn remote_authn_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let (authenticator, backend, headers) = setup();

    // No fail point configured
    let metadata = authenticator.authenticate(&RequestContext::new(), &headers).await.unwrap();
    assert_eq!(metadata.public(), Some(&json!({"user": "alice"})));
    assert_eq!(backend.calls(), 1);

    scenario.teardown();
}
