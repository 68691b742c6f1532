//! Integration tests for remote authorization over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use castellan_authn::AuthenticationMetadata;
use castellan_authz::{
    Authorizer, AuthorizerFactory, BaseAuthorizerFactory, DeduplicatingAuthorizerFactory,
    InstanceName, Permission, RemoteAuthorizer, config::AuthorizationPolicy,
    remote::HttpAuthorizationBackend,
};
use castellan_cache::RequestContext;
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use tonic::Code;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, method, path},
};

fn names(names: &[&str]) -> Vec<InstanceName> {
    names.iter().map(|name| InstanceName::new(name).unwrap()).collect()
}

fn metadata() -> AuthenticationMetadata {
    AuthenticationMetadata::from_raw(json!({
        "public": {"user": "alice"},
        "private": {"groups": ["builders"]},
    }))
    .unwrap()
}

fn allow_all(count: usize) -> Value {
    let until = (Utc::now() + TimeDelta::hours(1)).to_rfc3339();
    let results: Vec<Value> =
        (0..count).map(|_| json!({"verdict": "allow", "cacheExpirationTime": until})).collect();
    json!({"results": results})
}

fn authorizer_for(server: &MockServer) -> RemoteAuthorizer {
    let backend = HttpAuthorizationBackend::builder()
        .endpoint(Url::parse(&format!("{}/authorize", server.uri())).unwrap())
        .build();
    RemoteAuthorizer::builder()
        .backend(Arc::new(backend))
        .scope(json!({"cluster": "eu-1"}))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_batched_request_wire_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .and(body_json(json!({
            "scope": {"cluster": "eu-1"},
            "authenticationMetadata": {"private": {"groups": ["builders"]}},
            "permission": "put",
            "instanceNames": ["prod", "dev/linux"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [
            {"verdict": "allow"},
            {"verdict": {"deny": "Builders may not write to dev"}},
        ]})))
        .expect(1)
        .mount(&server)
        .await;
    let authorizer = authorizer_for(&server);

    let verdicts = authorizer
        .authorize(
            &RequestContext::new(),
            &metadata(),
            &Permission::new("put"),
            &names(&["prod", "dev/linux"]),
        )
        .await;
    assert!(verdicts[0].is_ok());
    let err = verdicts[1].as_ref().unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "Builders may not write to dev");
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_rpc() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(allow_all(1))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let authorizer = authorizer_for(&server);
    let ctx = RequestContext::new();
    let metadata = metadata();
    let permission = Permission::new("get");
    let instance_names = names(&["prod"]);

    let (first, second) = tokio::join!(
        authorizer.authorize(&ctx, &metadata, &permission, &instance_names),
        authorizer.authorize(&ctx, &metadata, &permission, &instance_names),
    );
    assert!(first[0].is_ok());
    assert!(second[0].is_ok());

    let stats = authorizer.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.waits, 1);
}

#[tokio::test]
async fn test_server_errors_are_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    let authorizer = authorizer_for(&server);

    for _ in 0..2 {
        let verdicts = authorizer
            .authorize(&RequestContext::new(), &metadata(), &Permission::new("get"), &names(&["a"]))
            .await;
        assert_eq!(verdicts[0].as_ref().unwrap_err().code(), Code::Unavailable);
    }
}

#[tokio::test]
async fn test_identical_policies_share_a_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(allow_all(1)))
        .expect(1)
        .mount(&server)
        .await;
    let endpoint = format!("{}/authorize", server.uri());
    let factory = DeduplicatingAuthorizerFactory::new(Arc::new(BaseAuthorizerFactory::default()));

    let get: AuthorizationPolicy = serde_json::from_value(json!({"remote": {
        "endpoint": endpoint,
        "scope": {"cluster": "eu-1", "tier": "gold"},
        "cacheReplacementPolicy": "LRU",
    }}))
    .unwrap();
    let put: AuthorizationPolicy = serde_json::from_str(&format!(
        r#"{{"remote": {{"cacheReplacementPolicy": "LRU", "scope": {{"tier": "gold", "cluster": "eu-1"}}, "endpoint": "{endpoint}"}}}}"#
    ))
    .unwrap();
    let get_authorizer = factory.new_authorizer(&get).unwrap();
    let put_authorizer = factory.new_authorizer(&put).unwrap();
    assert!(Arc::ptr_eq(&get_authorizer, &put_authorizer));

    let ctx = RequestContext::new();
    let permission = Permission::new("get");
    for authorizer in [&get_authorizer, &put_authorizer] {
        let verdicts =
            authorizer.authorize(&ctx, &metadata(), &permission, &names(&["prod"])).await;
        assert!(verdicts[0].is_ok());
    }
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
async fn test_remote_authorization_creates_span() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let authorizer = RemoteAuthorizer::builder()
        .backend(Arc::new(castellan_authz::testutil::MockAuthorizationBackend::allow(None)))
        .build()
        .unwrap();
    authorizer
        .authorize(&RequestContext::new(), &metadata(), &Permission::new("get"), &names(&["a"]))
        .await;

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "authorize"),
        "expected an 'authorize' span, got: {recorded:?}"
    );
}
