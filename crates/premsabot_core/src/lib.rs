//! Ingestion and upload pipeline for Generalitat de Catalunya Press Room
//! images: paginated search ingest, durable batch and queue state, shared id
//! ledger on the destination wiki, and the uploader itself.

pub mod batch;
pub mod collector;
pub mod commons;
pub mod config;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod resume;
pub mod search;
pub mod timeparse;
pub mod upload;
