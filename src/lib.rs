//! Settlement of SPEI bank-transfer payments: reference issuance,
//! reconciliation, webhook ingestion, expiration and receipts.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
