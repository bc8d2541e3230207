//! Messages produced by collector workers, as delivered on the broker.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use uuid::Uuid;

use crate::codec::Codec;
use crate::error::ClassifiedError;
use crate::identity;
use crate::observation::{Attributes, GeoLocation, Observation, Source, TlpLevel};
use crate::record::RecordKey;

pub const PROFILE_DISCOVERED: &str = "profile.discovered";
pub const CONTENT_POSTED: &str = "content.posted";

/// Outer shape shared by every message. The body stays raw until a handler for `message_type`
/// has been found, so it can be decoded straight into that handler's type.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub trace_id: Uuid,
    pub source: Source,
    pub payload: Box<RawValue>,
}

/// A message body that collectors publish, tagged with the type its handler is registered under.
pub trait DomainEvent: Serialize {
    const MESSAGE_TYPE: &'static str;

    /// Broker key of the event. Events about the same entity share a key, so they land on the same
    /// partition and are consumed in order.
    fn partition_key(&self, source: Source) -> String;
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, E> {
    #[serde(rename = "type")]
    message_type: &'static str,
    trace_id: Uuid,
    source: Source,
    payload: &'a E,
}

/// An event encoded into an `Envelope`, ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_type: &'static str,
    pub trace_id: Uuid,
    pub key: String,
    pub payload: String,
}

impl OutgoingMessage {
    pub fn new<E: DomainEvent, C: Codec>(
        codec: &C,
        trace_id: Uuid,
        source: Source,
        event: &E,
    ) -> Result<Self, ClassifiedError> {
        let payload = codec.encode(&OutgoingEnvelope {
            message_type: E::MESSAGE_TYPE,
            trace_id,
            source,
            payload: event,
        })?;

        Ok(Self {
            message_type: E::MESSAGE_TYPE,
            trace_id,
            key: event.partition_key(source),
            payload,
        })
    }
}

/// Emitted when a crawler discovers a user profile, channel, or other entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDiscovered {
    /// Id inside the source platform (e.g. a numeric Instagram id). Mandatory for deduplication.
    pub external_id: String,
    /// Login or handle, if not hidden.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub raw_data_reference: String,
    #[serde(default)]
    pub location: Option<GeoLocation>,
    /// Source-specific fields (e.g. is_premium, reputation, pgp_key).
    #[serde(default)]
    pub details: Attributes,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tlp: Option<TlpLevel>,
    #[serde(default)]
    pub investigation_id: Option<Uuid>,
}

impl ProfileDiscovered {
    /// Resolve the identity of the profile and describe it as an `Observation`.
    /// `received_at` stands in for `observed_at` when the collector did not provide one.
    pub fn into_observation(
        self,
        source: Source,
        trace_id: Uuid,
        received_at: DateTime<Utc>,
    ) -> Result<(RecordKey, Observation), ClassifiedError> {
        let key = RecordKey::new(source, &self.external_id)?;
        let mut observation = Observation::new(
            source,
            &self.external_id,
            &self.raw_data_reference,
            trace_id,
            self.observed_at.unwrap_or(received_at),
        )?;

        observation.username = self.username;
        observation.display_name = self.display_name;
        observation.url = self.url;
        observation.location = self.location;
        observation.attributes = self.details;
        insert_common_attributes(&mut observation.attributes, self.tlp, self.investigation_id);

        Ok((key, observation))
    }
}

impl DomainEvent for ProfileDiscovered {
    const MESSAGE_TYPE: &'static str = PROFILE_DISCOVERED;

    fn partition_key(&self, source: Source) -> String {
        format!("{source}:{}", identity::normalize(&self.external_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentType {
    Image,
    Video,
    Document,
    Audio,
    Archive,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub attachment_type: AttachmentType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Emitted when a crawler observes a post, message or comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPosted {
    /// Id of the post, only unique within its author or channel.
    pub external_id: String,
    pub author_external_id: String,
    pub raw_data_reference: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Engagement counters, e.g. views or reactions.
    #[serde(default)]
    pub metrics: BTreeMap<String, i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tlp: Option<TlpLevel>,
}

impl ContentPosted {
    /// Posts are keyed by `(author, post id)`; their content goes into the attribute bag.
    pub fn into_observation(
        self,
        source: Source,
        trace_id: Uuid,
        received_at: DateTime<Utc>,
    ) -> Result<(RecordKey, Observation), ClassifiedError> {
        let key = RecordKey::composite(source, [&self.author_external_id, &self.external_id])?;
        let mut observation = Observation::new(
            source,
            &key.external_id,
            &self.raw_data_reference,
            trace_id,
            self.observed_at.unwrap_or(received_at),
        )?;

        observation.url = self.url;

        let attributes = &mut observation.attributes;
        attributes.insert(
            "author_external_id".to_owned(),
            Value::String(self.author_external_id),
        );
        attributes.insert("post_external_id".to_owned(), Value::String(self.external_id));
        if let Some(text) = self.text {
            attributes.insert("text".to_owned(), Value::String(text));
        }
        if let Some(language) = self.language {
            attributes.insert("language".to_owned(), Value::String(language));
        }
        if let Some(created_at) = self.created_at {
            attributes.insert("created_at".to_owned(), Value::String(created_at.to_rfc3339()));
        }
        if !self.attachments.is_empty() {
            attributes.insert("attachments".to_owned(), serde_json::json!(self.attachments));
        }
        if !self.metrics.is_empty() {
            attributes.insert("metrics".to_owned(), serde_json::json!(self.metrics));
        }
        insert_common_attributes(attributes, self.tlp, None);

        Ok((key, observation))
    }
}

/// Posts are keyed by their author, next to the author's own profile.
impl DomainEvent for ContentPosted {
    const MESSAGE_TYPE: &'static str = CONTENT_POSTED;

    fn partition_key(&self, source: Source) -> String {
        format!("{source}:{}", identity::normalize(&self.author_external_id))
    }
}

/// Only explicitly provided values are written, so an unlabeled observation does not reset a
/// level set earlier.
fn insert_common_attributes(
    attributes: &mut Attributes,
    tlp: Option<TlpLevel>,
    investigation_id: Option<Uuid>,
) {
    if let Some(tlp) = tlp {
        attributes.insert("tlp".to_owned(), serde_json::json!(tlp));
    }
    if let Some(investigation_id) = investigation_id {
        attributes.insert(
            "investigation_id".to_owned(),
            Value::String(investigation_id.to_string()),
        );
    }
}
