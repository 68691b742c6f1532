//! Integration tests for building authorizers from policies.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::io::Write;

use castellan_authn::AuthenticationMetadata;
use castellan_authz::{
    AuthorizerFactory, BaseAuthorizerFactory, BoundAuthorizer, InstanceName, Permission,
    config::AuthorizationPolicy, factory::AuthorizerDependencies,
};
use castellan_cache::RequestContext;
use rstest::rstest;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tonic::Code;

fn bound(policy: serde_json::Value, factory: &BaseAuthorizerFactory) -> BoundAuthorizer {
    let policy: AuthorizationPolicy = serde_json::from_value(policy).unwrap();
    BoundAuthorizer::new(factory.new_authorizer(&policy).unwrap(), Permission::new("get"))
}

async fn code(authorizer: &BoundAuthorizer, metadata: &AuthenticationMetadata, name: &str) -> Code {
    authorizer
        .authorize_single(&RequestContext::new(), metadata, &InstanceName::new(name).unwrap())
        .await
        .map_or_else(|err| err.code(), |()| Code::Ok)
}

#[rstest]
#[case::allow(json!("allow"), "anything", Code::Ok)]
#[case::deny(json!("deny"), "anything", Code::PermissionDenied)]
#[case::prefix_match(json!({"instanceNamePrefix": ["prod"]}), "prod/linux", Code::Ok)]
#[case::prefix_miss(json!({"instanceNamePrefix": ["prod"]}), "production", Code::PermissionDenied)]
#[case::root_prefix(json!({"instanceNamePrefix": [""]}), "any/name", Code::Ok)]
#[case::expression(
    json!({"jmespathExpression": {"expression": "starts_with(instanceName, 'tenants/')"}}),
    "tenants/a",
    Code::Ok
)]
#[tokio::test]
async fn test_policies(
    #[case] policy: serde_json::Value,
    #[case] instance_name: &str,
    #[case] expected: Code,
) {
    let authorizer = bound(policy, &BaseAuthorizerFactory::default());
    assert_eq!(code(&authorizer, &AuthenticationMetadata::empty(), instance_name).await, expected);
}

#[tokio::test]
async fn test_expression_with_context_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{"writable": ["prod", "staging"]}"#).unwrap();
    let shutdown = CancellationToken::new();
    let factory =
        BaseAuthorizerFactory::new(AuthorizerDependencies::builder().shutdown(shutdown.clone()).build());

    let authorizer = bound(
        json!({"jmespathExpression": {
            "expression": "authenticationMetadata.public.user == 'alice' && contains(files.grants.writable, instanceName)",
            "contextFiles": {"grants": file.path()},
        }}),
        &factory,
    );
    let alice = AuthenticationMetadata::from_raw(json!({"public": {"user": "alice"}})).unwrap();
    let bob = AuthenticationMetadata::from_raw(json!({"public": {"user": "bob"}})).unwrap();

    assert_eq!(code(&authorizer, &alice, "prod").await, Code::Ok);
    assert_eq!(code(&authorizer, &alice, "dev").await, Code::PermissionDenied);
    assert_eq!(code(&authorizer, &bob, "prod").await, Code::PermissionDenied);

    shutdown.cancel();
}

#[test]
fn test_missing_context_file_is_invalid_argument() {
    let policy: AuthorizationPolicy = serde_json::from_value(json!({"jmespathExpression": {
        "expression": "`true`",
        "contextFiles": {"grants": "/nonexistent/grants.json"},
    }}))
    .unwrap();
    let err = BaseAuthorizerFactory::default().new_authorizer(&policy).err().unwrap();
    assert_eq!(err.code(), Code::InvalidArgument);
}
