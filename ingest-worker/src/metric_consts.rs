pub const MESSAGES_RECEIVED: &str = "ingest_messages_received";
pub const MESSAGES_COMPLETED: &str = "ingest_messages_completed";
pub const MESSAGES_REDELIVERED: &str = "ingest_messages_redelivered";
pub const MESSAGES_DEAD_LETTERED: &str = "ingest_messages_dead_lettered";
pub const DEAD_LETTER_FAILURES: &str = "ingest_dead_letter_failures";
pub const MESSAGE_PROCESSING_DURATION: &str = "ingest_message_processing_duration_seconds";
pub const RECORDS_UPSERTED: &str = "ingest_records_upserted";
pub const WORKER_QUEUE_DEPTH: &str = "ingest_worker_queue_depth";
pub const EVENTS_PUBLISHED: &str = "ingest_events_published";
