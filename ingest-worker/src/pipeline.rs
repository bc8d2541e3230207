//! # Pipeline
//!
//! Per-message state machine run by every consumer worker:
//!
//! 1. Decode the envelope. A payload that does not decode is fatal.
//! 2. Bind the trace id, message id and source to a span covering the rest of the processing.
//! 3. Dispatch the body to the handler registered for the message type.
//! 4. Classify a handler failure: a `ClassifiedError` keeps its class, anything else is a defect.
//! 5. Resolve: completed, redeliver (returned as `Err`), or dead-letter and complete.
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use ingest_common::codec::{Codec, JsonCodec};
use ingest_common::dead_letter::DeadLetterSink;
use ingest_common::error::{ClassifiedError, ErrorCode};
use ingest_common::messages::Envelope;
use ingest_common::observation::Source;
use serde::de::DeserializeOwned;
use tracing::{error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::metric_consts::{
    DEAD_LETTER_FAILURES, MESSAGES_COMPLETED, MESSAGES_DEAD_LETTERED, MESSAGES_RECEIVED,
    MESSAGES_REDELIVERED, MESSAGE_PROCESSING_DURATION,
};

/// Diagnostic context of the message being processed, passed explicitly to handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub trace_id: Uuid,
    /// Broker-assigned id of this delivery, e.g. `topic:partition:offset`.
    pub message_id: String,
    pub message_type: String,
    pub source: Source,
    pub received_at: DateTime<Utc>,
}

/// Handles the decoded body of one message type.
///
/// Handlers should let errors propagate with `?`. Errors that are not `ClassifiedError`s are treated
/// as defects and dead-lettered, so anything transient must be classified as retryable before it
/// is returned.
#[async_trait]
pub trait Handler: Send + Sync {
    type Message: DeserializeOwned + Send + 'static;

    async fn handle(&self, context: &MessageContext, message: Self::Message) -> anyhow::Result<()>;
}

#[async_trait]
trait Route<C: Codec>: Send + Sync {
    async fn dispatch(&self, codec: &C, context: &MessageContext, body: &str) -> anyhow::Result<()>;
}

struct TypedRoute<H>(H);

#[async_trait]
impl<C, H> Route<C> for TypedRoute<H>
where
    C: Codec + 'static,
    H: Handler + 'static,
{
    async fn dispatch(&self, codec: &C, context: &MessageContext, body: &str) -> anyhow::Result<()> {
        let message: H::Message = codec.decode(body.as_bytes())?;
        self.0.handle(context, message).await
    }
}

/// A message as handed over by the broker.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub message_id: &'a str,
    pub payload: &'a [u8],
    /// Broker timestamp of the message. Unlike the local clock it is the same on every
    /// redelivery, so it is preferred as the receipt time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// How a delivery was resolved. Both variants mean the message must be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    DeadLettered(ErrorCode),
}

pub struct EventPipeline<C: Codec = JsonCodec> {
    codec: C,
    routes: HashMap<String, Box<dyn Route<C>>>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl EventPipeline<JsonCodec> {
    pub fn new(dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self::with_codec(JsonCodec, dead_letters)
    }
}

impl<C: Codec + 'static> EventPipeline<C> {
    pub fn with_codec(codec: C, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            codec,
            routes: HashMap::new(),
            dead_letters,
        }
    }

    /// Route messages of `message_type` to `handler`. Registering a type twice replaces the first
    /// handler.
    pub fn register<H: Handler + 'static>(mut self, message_type: &str, handler: H) -> Self {
        let previous = self
            .routes
            .insert(message_type.to_owned(), Box::new(TypedRoute(handler)));
        if previous.is_some() {
            warn!(message_type, "replaced previously registered handler");
        }
        self
    }

    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Process one delivery.
    ///
    /// `Ok` means the message is done with and must be acknowledged, whether it was handled or
    /// dead-lettered. `Err` carries a retryable error and means the message must be redelivered.
    pub async fn process(&self, delivery: Delivery<'_>) -> Result<Disposition, ClassifiedError> {
        let span = info_span!(
            "message",
            message_id = %delivery.message_id,
            trace_id = field::Empty,
            message_type = field::Empty,
            source = field::Empty,
        );

        self.process_in_span(delivery).instrument(span).await
    }

    async fn process_in_span(&self, delivery: Delivery<'_>) -> Result<Disposition, ClassifiedError> {
        let start = Instant::now();
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let envelope: Envelope = match self.codec.decode(delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                let error = error.with_context("message_id", delivery.message_id);
                return self.resolve_failure(delivery, error, start).await;
            }
        };

        let context = MessageContext {
            trace_id: envelope.trace_id,
            message_id: delivery.message_id.to_owned(),
            message_type: envelope.message_type,
            source: envelope.source,
            received_at: delivery.timestamp.unwrap_or_else(Utc::now),
        };
        let span = Span::current();
        span.record("trace_id", field::display(context.trace_id));
        span.record("message_type", context.message_type.as_str());
        span.record("source", field::display(context.source));
        info!(bytes = delivery.payload.len(), "received message");

        match self.dispatch(&context, envelope.payload.get()).await {
            Ok(()) => {
                let labels = [("message_type", context.message_type.clone())];
                metrics::counter!(MESSAGES_COMPLETED, &labels).increment(1);
                metrics::histogram!(MESSAGE_PROCESSING_DURATION, &labels)
                    .record(start.elapsed().as_secs_f64());
                info!("processed message");

                Ok(Disposition::Completed)
            }
            Err(error) => {
                let error = error
                    .with_context("message_id", context.message_id.as_str())
                    .with_context("trace_id", context.trace_id.to_string())
                    .with_context("message_type", context.message_type.as_str());
                self.resolve_failure(delivery, error, start).await
            }
        }
    }

    async fn dispatch(&self, context: &MessageContext, body: &str) -> Result<(), ClassifiedError> {
        let Some(route) = self.routes.get(&context.message_type) else {
            return Err(ClassifiedError::fatal(
                ErrorCode::ValidationError,
                format!("no handler registered for message type {}", context.message_type),
            ));
        };

        match AssertUnwindSafe(route.dispatch(&self.codec, context, body))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(classify(error)),
            Err(panic) => Err(ClassifiedError::fatal(
                ErrorCode::InternalError,
                format!("handler panicked: {}", panic_message(&*panic)),
            )),
        }
    }

    async fn resolve_failure(
        &self,
        delivery: Delivery<'_>,
        error: ClassifiedError,
        start: Instant,
    ) -> Result<Disposition, ClassifiedError> {
        let code = error.code();
        let labels = [
            ("error_code", code.as_str().to_owned()),
            ("catalogue_id", code.catalogue_id().to_owned()),
        ];
        metrics::histogram!(MESSAGE_PROCESSING_DURATION, &labels)
            .record(start.elapsed().as_secs_f64());

        if error.is_retryable() {
            warn!(error_code = %code, error = %error, "message will be redelivered");
            metrics::counter!(MESSAGES_REDELIVERED, &labels).increment(1);
            return Err(error);
        }

        error!(error_code = %code, error = %error, "dead-lettering message");

        match self.dead_letters.record(delivery.payload, &error).await {
            Ok(()) => {
                metrics::counter!(MESSAGES_DEAD_LETTERED, &labels).increment(1);
                Ok(Disposition::DeadLettered(code))
            }
            Err(sink_error) => {
                // Acknowledging now would lose the message, ask for it again instead.
                error!(
                    error_code = %code,
                    sink_error_code = %sink_error.code(),
                    error = %sink_error,
                    "failed to record dead letter"
                );
                metrics::counter!(DEAD_LETTER_FAILURES).increment(1);

                Err(ClassifiedError::retryable(
                    ErrorCode::ConnectivityError,
                    format!("failed to record dead letter for {code} failure"),
                )
                .with_context("message_id", delivery.message_id)
                .with_cause(sink_error))
            }
        }
    }
}

/// Keep the class of errors that were already classified, treat everything else as a defect.
fn classify(error: anyhow::Error) -> ClassifiedError {
    match error.downcast::<ClassifiedError>() {
        Ok(classified) => classified,
        Err(error) => ClassifiedError::internal(error),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
