use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClassifiedError;
use crate::identity::{self, Identity};
use crate::observation::{Attributes, GeoLocation, Source};

/// The upsert key of a canonical record: the source plus its normalized source-local id.
/// `id` is derived from the other two and is what stores actually key on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub id: Identity,
    pub source: Source,
    pub external_id: String,
}

impl RecordKey {
    pub fn new(source: Source, external_id: &str) -> Result<Self, ClassifiedError> {
        let id = identity::identity_for(source, external_id)?;

        Ok(Self {
            id,
            source,
            external_id: identity::normalize(external_id),
        })
    }

    /// Key an entity that is only unique within a scope, e.g. `[channel, post_id]`.
    pub fn composite<I, S>(source: Source, parts: I) -> Result<Self, ClassifiedError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let external_id = identity::normalize_composite(source, parts)?;
        let id = identity::identity_for(source, &external_id)?;

        Ok(Self {
            id,
            source,
            external_id,
        })
    }
}

/// The merged, stored view of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Identity,
    pub source: Source,
    pub external_id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub url: Option<String>,
    pub raw_data_reference: String,
    pub trace_id: Uuid,
    /// Last time any source saw this entity.
    pub observed_at: DateTime<Utc>,
    pub attributes: Attributes,
    pub location: Option<GeoLocation>,
    /// Incremented every time a reconciliation changes the record.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            id: self.id,
            source: self.source,
            external_id: self.external_id.clone(),
        }
    }

    /// Compare everything except bookkeeping.
    pub fn same_content(&self, other: &CanonicalRecord) -> bool {
        self.id == other.id
            && self.source == other.source
            && self.external_id == other.external_id
            && self.username == other.username
            && self.display_name == other.display_name
            && self.url == other.url
            && self.raw_data_reference == other.raw_data_reference
            && self.trace_id == other.trace_id
            && self.observed_at == other.observed_at
            && self.attributes == other.attributes
            && self.location == other.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_stores_normalized_external_id() {
        let key = RecordKey::new(Source::Telegram, "  Durov ").unwrap();

        assert_eq!(key.external_id, "durov");
        assert_eq!(key.id, identity::identity_for(Source::Telegram, "durov").unwrap());
    }

    #[test]
    fn test_composite_key_joins_parts() {
        let key = RecordKey::composite(Source::Telegram, ["Chronos_News", " 42"]).unwrap();

        assert_eq!(key.external_id, "chronos_news:42");
        assert_eq!(
            key.id,
            identity::composite_identity_for(Source::Telegram, ["chronos_news", "42"]).unwrap()
        );
    }
}
