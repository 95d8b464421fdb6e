//! Domain model: money, the pending-payment state machine, audit records and
//! the ports the application layer talks to.

pub mod actor;
pub mod audit;
pub mod clock;
pub mod money;
pub mod pending_payment;
pub mod ports;
pub mod reconciliation;
pub mod settlement;
pub mod webhook;
