//! Catalog server API: wire types, domain types and request transport.

pub mod api_types;
pub mod client;
pub mod transport;
pub mod types;

pub use client::HttpNetwork;
pub use transport::{Network, Outcome, RequestId, Transport, TransportErrorKind, WireRequest};
pub use types::{Bank, CashPoint, Cluster, EntityId, EntityKind, Town};
