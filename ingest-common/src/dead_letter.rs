//! # Dead letters
//!
//! Messages that cannot be processed (because they are malformed, or because of a fatal error)
//! are parked in a dead-letter sink together with the classified error, so they can be inspected
//! and replayed by an operator instead of blocking the consumer.
use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::error::{ClassifiedError, ErrorCode, ErrorContext};
use crate::store::classify_db_error;

/// A message that was given up on, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The message exactly as it was received.
    pub payload: Vec<u8>,
    pub code: ErrorCode,
    pub message: String,
    pub context: ErrorContext,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(payload: &[u8], error: &ClassifiedError) -> Self {
        Self {
            payload: payload.to_vec(),
            code: error.code(),
            message: error.message().to_owned(),
            context: error.context().clone(),
            retryable: error.is_retryable(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, payload: &[u8], error: &ClassifiedError) -> Result<(), ClassifiedError>;
}

/// PostgreSQL text cannot hold NUL, not even escaped inside JSONB.
fn without_nul(value: &str) -> Cow<'_, str> {
    if value.contains('\0') {
        Cow::Owned(value.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(value)
    }
}

/// A `DeadLetterSink` writing to a PostgreSQL table (see `migrations/`).
pub struct PgDeadLetterSink {
    table: String,
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn record(&self, payload: &[u8], error: &ClassifiedError) -> Result<(), ClassifiedError> {
        let letter = DeadLetter::new(payload, error);
        let context: ErrorContext = letter
            .context
            .iter()
            .map(|(key, value)| (without_nul(key).into_owned(), without_nul(value).into_owned()))
            .collect();
        let encoded_context = JsonCodec.encode(&context)?;

        let message = without_nul(&letter.message);
        let message_id = context.get("message_id").map(String::as_str);
        // Absent when the envelope itself could not be decoded.
        let trace_id = letter
            .context
            .get("trace_id")
            .and_then(|trace_id| Uuid::parse_str(trace_id).ok());

        let query = format!(
            r#"
INSERT INTO "{0}"
    (id, payload, error_code, catalogue_id, error_message, error_context, retryable, message_id, trace_id, failed_at)
VALUES
    ($1, $2, $3, $4, $5, $6::jsonb, $7, $8, $9, $10)
            "#,
            self.table
        );

        sqlx::query(&query)
            .bind(Uuid::now_v7())
            .bind(&letter.payload)
            .bind(letter.code.as_str())
            .bind(letter.code.catalogue_id())
            .bind(message.as_ref())
            .bind(encoded_context)
            .bind(letter.retryable)
            .bind(message_id)
            .bind(trace_id)
            .bind(letter.failed_at)
            .execute(&self.pool)
            .await
            .map_err(|error| classify_db_error(error, "INSERT"))?;

        Ok(())
    }
}

/// A `DeadLetterSink` kept in process memory.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every dead letter recorded so far, oldest first.
    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, payload: &[u8], error: &ClassifiedError) -> Result<(), ClassifiedError> {
        self.letters.lock().await.push(DeadLetter::new(payload, error));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_keeps_error_details() {
        let sink = MemoryDeadLetterSink::new();
        let error = ClassifiedError::fatal(ErrorCode::ValidationError, "external_id is blank")
            .with_context("message_id", "ingest:0:42");

        sink.record(br#"{"type":"profile.discovered"}"#, &error)
            .await
            .unwrap();

        let letters = sink.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, br#"{"type":"profile.discovered"}"#);
        assert_eq!(letters[0].code, ErrorCode::ValidationError);
        assert_eq!(letters[0].message, "external_id is blank");
        assert_eq!(letters[0].context["message_id"], "ingest:0:42");
        assert!(!letters[0].retryable);
    }

    #[test]
    fn test_dead_letter_serializes_code_as_name() {
        let letter = DeadLetter::new(
            b"garbage",
            &ClassifiedError::fatal(ErrorCode::SerializationError, "failed to deserialize JSON"),
        );

        let value = serde_json::to_value(&letter).unwrap();

        assert_eq!(value["code"], "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_without_nul_only_copies_when_needed() {
        assert!(matches!(without_nul("clean"), Cow::Borrowed("clean")));
        assert_eq!(without_nul("abc\0def"), "abc\u{FFFD}def");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_sink_stores_payload_bytes_verbatim(db: PgPool) {
        let sink = PgDeadLetterSink::new_from_pool("dead_letters", db.clone());
        let payload = b"{\"type\": \"profile.\0discovered\"}\xff";
        let error = ClassifiedError::fatal(ErrorCode::SerializationError, "failed to deserialize JSON")
            .with_context("message_id", "observations:0:7")
            .with_context("trace_id", "0190163d-8694-739b-aea5-966c26f8ad91")
            .with_payload_snippet(payload);

        sink.record(payload, &error).await.unwrap();

        let (stored, error_code, catalogue_id, message_id, trace_id, snippet): (
            Vec<u8>,
            String,
            String,
            Option<String>,
            Option<Uuid>,
            Option<String>,
        ) = sqlx::query_as(
            "SELECT payload, error_code, catalogue_id, message_id, trace_id, \
                error_context->>'payload_snippet' FROM dead_letters",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(stored, payload);
        assert_eq!(error_code, "SERIALIZATION_ERROR");
        assert_eq!(catalogue_id, "INGEST-002");
        assert_eq!(message_id.as_deref(), Some("observations:0:7"));
        assert_eq!(
            trace_id,
            Some(Uuid::parse_str("0190163d-8694-739b-aea5-966c26f8ad91").unwrap())
        );
        let snippet = snippet.unwrap();
        assert!(!snippet.contains('\0'));
        assert!(snippet.starts_with("{\"type\": \"profile.\u{FFFD}discovered"));
    }
}
