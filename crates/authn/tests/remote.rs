//! Integration tests for remote authentication over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use castellan_authn::{
    Authenticator, RemoteRequestHeadersAuthenticator,
    remote::HttpAuthenticationBackend,
    testutil::MockAuthenticationBackend,
};
use castellan_cache::RequestContext;
use chrono::{TimeDelta, Utc};
use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use serde_json::json;
use tonic::Code;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, method, path},
};

fn authenticator_for(server: &MockServer) -> RemoteRequestHeadersAuthenticator {
    let backend = HttpAuthenticationBackend::builder()
        .endpoint(Url::parse(&format!("{}/authenticate", server.uri())).unwrap())
        .build();
    RemoteRequestHeadersAuthenticator::builder()
        .backend(Arc::new(backend))
        .scope(json!({"deployment": "ci"}))
        .header_keys(vec!["authorization".to_owned()])
        .build()
        .unwrap()
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
    headers
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_rpc() {
    let server = MockServer::start().await;
    let until = Utc::now() + TimeDelta::hours(1);
    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .and(body_json(json!({
            "scope": {"deployment": "ci"},
            "requestMetadata": {"authorization": ["Bearer token"]},
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "allow": {"public": {"user": "alice"}},
                    "cacheExpirationTime": until.to_rfc3339(),
                }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let authenticator = authenticator_for(&server);
    let ctx = RequestContext::new();
    let headers = bearer("token");

    let (first, second) = tokio::join!(
        authenticator.authenticate(&ctx, &headers),
        authenticator.authenticate(&ctx, &headers),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.public(), Some(&json!({"user": "alice"})));
    assert_eq!(first, second);

    let stats = authenticator.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.waits, 1);
}

#[tokio::test]
async fn test_deny_verdict_is_unauthenticated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deny": "Token revoked"})))
        .mount(&server)
        .await;
    let authenticator = authenticator_for(&server);

    let err = authenticator.authenticate(&RequestContext::new(), &bearer("token")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
    assert_eq!(err.message(), "Token revoked");
}

#[tokio::test]
async fn test_server_errors_are_unavailable_and_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    let authenticator = authenticator_for(&server);
    let ctx = RequestContext::new();

    for _ in 0..2 {
        let err = authenticator.authenticate(&ctx, &bearer("token")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.is_transient());
    }
}

#[tokio::test]
async fn test_caller_deadline_interrupts_slow_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"allow": {}}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let authenticator = authenticator_for(&server);
    let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));

    let err = authenticator.authenticate(&ctx, &bearer("token")).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_owner_unaffected() {
    let backend = Arc::new(
        MockAuthenticationBackend::allow(json!({}), Some(Utc::now() + TimeDelta::hours(1)))
            .with_delay(Duration::from_millis(200)),
    );
    let authenticator = RemoteRequestHeadersAuthenticator::builder()
        .backend(backend.clone())
        .header_keys(vec!["authorization".to_owned()])
        .build()
        .unwrap();
    let headers = bearer("token");
    let owner_ctx = RequestContext::new();
    let waiter_ctx = RequestContext::new();

    let (owner, waiter) = tokio::join!(authenticator.authenticate(&owner_ctx, &headers), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_ctx.cancel();
        authenticator.authenticate(&waiter_ctx, &headers).await
    });
    assert!(owner.is_ok());
    assert_eq!(waiter.unwrap_err().code(), Code::Cancelled);
    assert_eq!(backend.calls(), 1);
}

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

#[tokio::test]
async fn test_remote_authentication_creates_span() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let authenticator = RemoteRequestHeadersAuthenticator::builder()
        .backend(Arc::new(MockAuthenticationBackend::allow(json!({}), None)))
        .header_keys(vec!["authorization".to_owned()])
        .build()
        .unwrap();
    authenticator.authenticate(&RequestContext::new(), &bearer("token")).await.unwrap();

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "authenticate"),
        "expected an 'authenticate' span, got: {recorded:?}"
    );
}
