//! # Castellan Authorization
//!
//! Authorizers deciding whether an authenticated requester may perform an
//! operation on an instance name.
//!
//! This crate provides:
//! - **Instance names**: validated slash-separated tenant names and a prefix trie
//! - **Authorizers**: static allow/deny, instance-name prefixes, JMESPath expressions and a
//!   remote service with batched, cached and deduplicated requests
//! - **Factories**: authorizers from `serde` policies, shared between identical policies
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use castellan_authn::AuthenticationMetadata;
//! use castellan_authz::{
//!     AuthorizerFactory, BaseAuthorizerFactory, BoundAuthorizer, InstanceName, Permission,
//!     config::AuthorizationPolicy,
//! };
//! use castellan_cache::RequestContext;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy: AuthorizationPolicy = serde_json::from_str(r#"{"instanceNamePrefix": ["prod"]}"#)?;
//! let authorizer = BaseAuthorizerFactory::default().new_authorizer(&policy)?;
//! let get = BoundAuthorizer::new(authorizer, Permission::new("get"));
//!
//! let metadata = AuthenticationMetadata::empty();
//! let ctx = RequestContext::new();
//! assert!(get.authorize_single(&ctx, &metadata, &InstanceName::new("prod/linux")?).await.is_ok());
//! assert!(get.authorize_single(&ctx, &metadata, &InstanceName::new("dev")?).await.is_err());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Authorizer trait and local authorizers.
pub mod authorizer;
/// Authorization policy configuration.
pub mod config;
/// Authorizers from configuration.
pub mod factory;
/// Instance names and permissions.
pub mod instance_name;
/// Authorization by JMESPath expression.
pub mod jmespath;
/// Remote authorization.
pub mod remote;
/// Shared test utilities (enabled with the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Instance-name prefix trie.
pub mod trie;

// Re-export key types for convenience
pub use authorizer::{Authorizer, BoundAuthorizer};
pub use factory::{AuthorizerFactory, BaseAuthorizerFactory, DeduplicatingAuthorizerFactory};
pub use instance_name::{InstanceName, Permission};
pub use remote::RemoteAuthorizer;
