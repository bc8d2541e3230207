//! # Identity
//!
//! Deterministic identifiers for observed entities.
//!
//! An identity is a version 5 UUID of `"<SOURCE>:<normalized key>"`, so the same entity seen again
//! by the same source always maps to the same identifier, across restarts and replays. The ids are
//! used as primary keys: the namespace and normalization rules must never change.
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorCode};
use crate::observation::Source;

const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b810_9dad_11d1_80b4_00c04fd430c8);

/// A stable, content-derived identifier of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Uuid);

impl Identity {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    fn from_key(key: &str) -> Self {
        Identity(Uuid::new_v5(&IDENTITY_NAMESPACE, key.as_bytes()))
    }
}

impl From<Identity> for Uuid {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl From<Uuid> for Identity {
    fn from(uuid: Uuid) -> Self {
        Identity(uuid)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trim and lower-case a source-local id.
pub fn normalize(external_id: &str) -> String {
    external_id.trim().to_lowercase()
}

/// Normalize each part of a composite key individually and join them with `:`.
pub fn normalize_composite<I, S>(source: Source, parts: I) -> Result<String, ClassifiedError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts = parts
        .into_iter()
        .map(|part| normalize(part.as_ref()))
        .collect::<Vec<_>>();

    if parts.is_empty() || parts.iter().any(String::is_empty) {
        return Err(blank_key_error(source, "composite key has a blank part"));
    }

    Ok(parts.join(":"))
}

/// Identity of the entity `external_id` as known by `source`.
pub fn identity_for(source: Source, external_id: &str) -> Result<Identity, ClassifiedError> {
    let normalized = normalize(external_id);
    if normalized.is_empty() {
        return Err(blank_key_error(source, "external id is blank"));
    }

    Ok(Identity::from_key(&format!("{}:{}", source.as_str(), normalized)))
}

/// Identity of an entity that is only unique within a scope, e.g. a post within a channel.
pub fn composite_identity_for<I, S>(source: Source, parts: I) -> Result<Identity, ClassifiedError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let key = normalize_composite(source, parts)?;

    Ok(Identity::from_key(&format!("{}:{}", source.as_str(), key)))
}

/// A blank id is a bug in whoever produced the message, retrying will not fix it.
fn blank_key_error(source: Source, message: &str) -> ClassifiedError {
    ClassifiedError::fatal(ErrorCode::ValidationError, message).with_context("source", source.as_str())
}
