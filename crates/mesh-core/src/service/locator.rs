//! Canonical service identity.
//!
//! A [`ServiceLocator`] names a logical service by `(group, name, version)`. Its GSV
//! string (`[group "!"] name [":" version]`) and the MurmurHash3 of that string are
//! what callers put on the wire, so both are computed once at construction.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::murmur3_32;

const GROUP_SEPARATOR: char = '!';
const VERSION_SEPARATOR: char = ':';
const HANDLER_SEPARATOR: char = '.';

/// Seed used for every id that travels on the wire.
pub const ROUTING_HASH_SEED: u32 = 0;

/// Error returned when a GSV string cannot be parsed back into a locator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("service name is empty in '{0}'")]
    EmptyName(String),

    #[error("service identity '{0}' contains more than one group separator")]
    MultipleGroupSeparators(String),
}

/// Hashes an arbitrary routing string the same way every peer does.
#[must_use]
pub fn routing_hash(key: &str) -> u32 {
    murmur3_32(key.as_bytes(), ROUTING_HASH_SEED)
}

/// Builds the GSV key, omitting empty group and version segments.
#[must_use]
pub fn gsv(group: &str, name: &str, version: &str) -> String {
    let mut key = String::with_capacity(group.len() + name.len() + version.len() + 2);
    if !group.is_empty() {
        key.push_str(group);
        key.push(GROUP_SEPARATOR);
    }
    key.push_str(name);
    if !version.is_empty() {
        key.push(VERSION_SEPARATOR);
        key.push_str(version);
    }
    key
}

/// Builds the handler key `gsv.handler`.
#[must_use]
pub fn handler_key(gsv: &str, handler: &str) -> String {
    let mut key = String::with_capacity(gsv.len() + handler.len() + 1);
    key.push_str(gsv);
    key.push(HANDLER_SEPARATOR);
    key.push_str(handler);
    key
}

/// Immutable identity of a logical service.
///
/// Equality and hashing use group, name and version only; tags are descriptive
/// metadata carried in exposure notifications.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "LocatorRepr", into = "LocatorRepr")]
pub struct ServiceLocator {
    group: String,
    name: String,
    version: String,
    tags: Vec<String>,
    gsv: String,
    id: u32,
}

#[derive(Serialize, Deserialize)]
struct LocatorRepr {
    #[serde(default)]
    group: String,
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl From<LocatorRepr> for ServiceLocator {
    fn from(repr: LocatorRepr) -> Self {
        Self::new(repr.group, repr.name, repr.version).with_tags(repr.tags)
    }
}

impl From<ServiceLocator> for LocatorRepr {
    fn from(locator: ServiceLocator) -> Self {
        Self {
            group: locator.group,
            name: locator.name,
            version: locator.version,
            tags: locator.tags,
        }
    }
}

impl ServiceLocator {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let group = group.into();
        let name = name.into();
        let version = version.into();
        let gsv = gsv(&group, &name, &version);
        let id = routing_hash(&gsv);
        Self { group, name, version, tags: Vec::new(), gsv, id }
    }

    /// Parses a GSV string such as `payments!Ledger:2.1` or `Echo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name segment is empty or the group separator repeats.
    pub fn parse(key: &str) -> Result<Self, LocatorError> {
        let (group, rest) = match key.split_once(GROUP_SEPARATOR) {
            Some((_, rest)) if rest.contains(GROUP_SEPARATOR) => {
                return Err(LocatorError::MultipleGroupSeparators(key.to_string()))
            }
            Some((group, rest)) => (group, rest),
            None => ("", key),
        };
        let (name, version) = rest.split_once(VERSION_SEPARATOR).unwrap_or((rest, ""));
        if name.is_empty() {
            return Err(LocatorError::EmptyName(key.to_string()));
        }
        Ok(Self::new(group, name, version))
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The `[group "!"] name [":" version]` key.
    pub fn gsv(&self) -> &str {
        &self.gsv
    }

    /// Wire service id: MurmurHash3 of the GSV key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wire handler id: MurmurHash3 of `gsv.handler`.
    #[must_use]
    pub fn handler_id(&self, handler: &str) -> u32 {
        routing_hash(&handler_key(&self.gsv, handler))
    }

    #[must_use]
    pub fn handler_key(&self, handler: &str) -> String {
        handler_key(&self.gsv, handler)
    }
}

impl PartialEq for ServiceLocator {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.name == other.name && self.version == other.version
    }
}

impl Eq for ServiceLocator {}

impl Hash for ServiceLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.gsv.hash(state);
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gsv)
    }
}

impl fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("gsv", &self.gsv)
            .field("id", &format_args!("{:#010x}", self.id))
            .field("tags", &self.tags)
            .finish()
    }
}
