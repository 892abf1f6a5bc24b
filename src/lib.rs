//! Catalog synchronization and cancellable server requests for the cash
//! points client.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod event;
pub mod notify;
pub mod request;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
