//! TWAIN Cloud relay: event broker, pub/sub seam and cloud API client.

pub mod broker;
pub mod connection;
pub mod pubsub;
