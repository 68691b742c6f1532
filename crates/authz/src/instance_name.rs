//! Instance names and permissions.

use std::{fmt, str::FromStr};

use castellan_authn::AuthError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Reasons a string is not a valid [`InstanceName`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InstanceNameError {
    /// The name has a leading, trailing or doubled slash.
    #[error("Instance name {name:?} contains an empty component")]
    EmptyComponent {
        /// The rejected name.
        name: String,
    },

    /// The name contains `.` or `..`.
    #[error("Instance name {name:?} contains relative component {component:?}")]
    RelativeComponent {
        /// The rejected name.
        name: String,
        /// The offending component.
        component: String,
    },
}

impl From<InstanceNameError> for AuthError {
    fn from(err: InstanceNameError) -> Self {
        AuthError::invalid_argument(err.to_string())
    }
}

/// Slash-separated name of a tenant, such as `prod/linux`.
///
/// The empty string is the root instance name, which has no components.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceName {
    name: String,
}

impl InstanceName {
    /// Parses an instance name.
    ///
    /// # Errors
    ///
    /// Returns an error if a component is empty, `.` or `..`.
    pub fn new(name: &str) -> Result<Self, InstanceNameError> {
        if !name.is_empty() {
            for component in name.split('/') {
                if component.is_empty() {
                    return Err(InstanceNameError::EmptyComponent { name: name.to_owned() });
                }
                if component == "." || component == ".." {
                    return Err(InstanceNameError::RelativeComponent {
                        name: name.to_owned(),
                        component: component.to_owned(),
                    });
                }
            }
        }
        Ok(Self { name: name.to_owned() })
    }

    /// Returns the root instance name.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns the name as a string.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns the components of the name, which are empty for the root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.name.split('/').filter(|component| !component.is_empty())
    }

    /// Returns whether `prefix` is this name or one of its ancestors.
    ///
    /// Matching is per component: `a/b` is a prefix of `a/b/c` but not of
    /// `a/bc`.
    pub fn has_prefix(&self, prefix: &InstanceName) -> bool {
        let mut components = self.components();
        prefix.components().all(|expected| components.next() == Some(expected))
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for InstanceName {
    type Err = InstanceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for InstanceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for InstanceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::new(&name).map_err(serde::de::Error::custom)
    }
}

/// Name of the operation an authorizer decides on, such as `get` or `put`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    /// Creates a permission.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the permission's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
