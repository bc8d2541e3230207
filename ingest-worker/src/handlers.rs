use std::sync::Arc;

use async_trait::async_trait;
use ingest_common::codec::Codec;
use ingest_common::messages::{ContentPosted, ProfileDiscovered, CONTENT_POSTED, PROFILE_DISCOVERED};
use ingest_common::record::CanonicalRecord;
use ingest_common::store::RecordStore;
use tracing::debug;

use crate::metric_consts::RECORDS_UPSERTED;
use crate::pipeline::{EventPipeline, Handler, MessageContext};

/// Merges discovered profiles into the profile store.
pub struct ProfileDiscoveredHandler {
    store: Arc<dyn RecordStore>,
}

impl ProfileDiscoveredHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for ProfileDiscoveredHandler {
    type Message = ProfileDiscovered;

    async fn handle(&self, context: &MessageContext, message: ProfileDiscovered) -> anyhow::Result<()> {
        let (key, observation) =
            message.into_observation(context.source, context.trace_id, context.received_at)?;

        let record = self.store.merge_observation(&key, &observation).await?;
        record_upserted(PROFILE_DISCOVERED, &record);

        Ok(())
    }
}

/// Merges observed posts into the content store.
pub struct ContentPostedHandler {
    store: Arc<dyn RecordStore>,
}

impl ContentPostedHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for ContentPostedHandler {
    type Message = ContentPosted;

    async fn handle(&self, context: &MessageContext, message: ContentPosted) -> anyhow::Result<()> {
        let (key, observation) =
            message.into_observation(context.source, context.trace_id, context.received_at)?;

        let record = self.store.merge_observation(&key, &observation).await?;
        record_upserted(CONTENT_POSTED, &record);

        Ok(())
    }
}

fn record_upserted(message_type: &'static str, record: &CanonicalRecord) {
    let created = if record.version == 1 { "true" } else { "false" };
    metrics::counter!(RECORDS_UPSERTED, "message_type" => message_type, "created" => created)
        .increment(1);
    debug!(
        record_id = %record.id,
        version = record.version,
        "upserted record"
    );
}

/// Register the handlers for every message type produced by the collectors.
pub fn register_default_handlers<C: Codec + 'static>(
    pipeline: EventPipeline<C>,
    profiles: Arc<dyn RecordStore>,
    posts: Arc<dyn RecordStore>,
) -> EventPipeline<C> {
    pipeline
        .register(PROFILE_DISCOVERED, ProfileDiscoveredHandler::new(profiles))
        .register(CONTENT_POSTED, ContentPostedHandler::new(posts))
}
