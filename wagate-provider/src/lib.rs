//! Session providers for wagate.
//!
//! A provider owns the actual WhatsApp session: pairing, reconnection and
//! message delivery. The server only sees the [`Provider`] trait and the
//! [`ProviderEvent`] stream it emits.
//!
//! - [`evolution`]: talks to an Evolution API gateway (Baileys under the hood)
//! - [`loopback`]: in-process stand-in for tests and frontend work

pub mod error;
pub mod event;
pub mod evolution;
pub mod loopback;
pub mod provider;

pub use error::ProviderError;
pub use event::{IncomingMessage, ProviderEvent};
pub use provider::{Provider, SendOptions};
