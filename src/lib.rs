//! Batch bib-number extraction over race photo archives.
//!
//! This library drives a resumable batch pipeline: incremental S3 listing
//! with Redis checkpoints, per-customer usage accounting, a two-stage
//! detection/extraction dispatcher, and idempotent PostgreSQL persistence.

pub mod config;
pub mod db;
pub mod driver;
pub mod models;
pub mod services;
