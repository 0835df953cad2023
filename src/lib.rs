//! Herald - Event fabric and real-time notification delivery
//!
//! Publish/subscribe messaging between decoupled services over a shared
//! broker, plus the notification service built on top of it: event
//! aggregation into persisted notification records and best-effort push
//! to live client connections.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod notify;
pub mod realtime;
