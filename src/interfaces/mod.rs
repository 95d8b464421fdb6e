//! Boundary types: API bodies and the CSV formats used for batch
//! reconciliation of bank statements.

pub mod api;
pub mod csv;
