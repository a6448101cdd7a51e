//! wagate-server: HTTP/WebSocket façade for a WhatsApp bot session.
//!
//! The session itself lives in a [`wagate_provider::Provider`]; this crate
//! tracks whether a device is linked, serves the pairing QR, relays outbound
//! messages, and pushes link-state changes to browsers.

pub mod config;
pub mod db;
pub mod error;
pub mod flow;
pub mod qr;
pub mod realtime;
pub mod server;
pub mod web;
