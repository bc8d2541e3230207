pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod metric_consts;
pub mod pipeline;
pub mod publisher;
