//! Multi-tenant WhatsApp support panel core.
//!
//! Each support agent owns one WhatsApp session. The [`instance`] module runs
//! those sessions (start, stop, logout, reconnection under a global start
//! rate), [`router`] assigns inbound contacts to the first agent that hears
//! from them, and [`store`] keeps the durable copy of both.

pub mod api;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod instance;
pub mod router;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
