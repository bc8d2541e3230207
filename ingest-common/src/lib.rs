pub mod codec;
pub mod dead_letter;
pub mod error;
pub mod identity;
pub mod merge;
pub mod messages;
pub mod metrics;
pub mod observation;
pub mod record;
pub mod retry;
pub mod store;
