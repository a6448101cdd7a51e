//! Realtime broadcast hub for browser clients.
//!
//! Every WebSocket client subscribes to one broadcast channel. Frames are
//! serialised once, at publish time:
//!
//! ```json
//! {"event":"connection","data":"connected"}
//! {"event":"connection","data":"data:image/png;base64,iVBOR..."}
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

/// Frames buffered per client before it starts skipping.
const HUB_CAPACITY: usize = 32;

/// Event name for link-state updates.
pub const CONNECTION_EVENT: &str = "connection";

/// Data sent with [`CONNECTION_EVENT`] once a device is linked.
pub const CONNECTED: &str = "connected";

#[derive(Debug, Serialize)]
struct Frame<'a> {
    event: &'a str,
    data: &'a str,
}

pub fn encode_frame(event: &str, data: &str) -> String {
    serde_json::to_string(&Frame { event, data }).unwrap_or_default()
}

pub struct Hub {
    tx: broadcast::Sender<String>,
    clients: AtomicUsize,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            clients: AtomicUsize::new(0),
        }
    }

    /// Send to every connected client. Returns how many will receive it.
    pub fn publish(&self, event: &str, data: &str) -> usize {
        self.tx.send(encode_frame(event, data)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_connected(&self) -> usize {
        self.clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
