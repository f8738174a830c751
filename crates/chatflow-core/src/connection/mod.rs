//! Connection management - gateway client and per-account sessions

mod client;
mod manager;

pub use client::{ChatSummary, ConnectOutcome, GatewayClient, HttpGatewayClient, SendReceipt};
pub use manager::{ConnectionManager, SessionHandle};
