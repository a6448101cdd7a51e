//! Shared state, provider event pump, and HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use wagate_provider::{IncomingMessage, Provider, ProviderError, ProviderEvent, SendOptions};

use crate::config::ServerConfig;
use crate::db::{Direction, MemoryDb};
use crate::flow::Flow;
use crate::qr;
use crate::realtime::{self, Hub};

/// Shared state accessible by all handlers and the event pump.
pub struct SharedState {
    pub config: ServerConfig,
    pub provider: Arc<dyn Provider>,
    /// Whether a device is linked, as of the latest provider event.
    connected: AtomicBool,
    pub hub: Hub,
    pub db: MemoryDb,
    pub flow: Flow,
    pub started_at: Instant,
}

impl SharedState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Send through the provider and log the outbound message.
    pub async fn send(
        &self,
        phone: &str,
        message: &str,
        options: &SendOptions,
    ) -> Result<(), ProviderError> {
        self.provider.send_message(phone, message, options).await?;
        self.db.record(Direction::Outbound, phone, message);
        Ok(())
    }
}

pub struct Server {
    config: ServerConfig,
    provider: Arc<dyn Provider>,
}

impl Server {
    pub fn new(config: ServerConfig, provider: Arc<dyn Provider>) -> Self {
        Self { config, provider }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        let flow = match self.config.flow_file {
            Some(ref path) => {
                let flow = Flow::load(path)?;
                tracing::info!("Loaded {} flow(s) from {}", flow.len(), path.display());
                flow
            }
            None => Flow::empty(),
        };
        Ok(Arc::new(SharedState {
            config: self.config.clone(),
            provider: Arc::clone(&self.provider),
            connected: AtomicBool::new(false),
            hub: Hub::new(),
            db: MemoryDb::new(),
            flow,
            started_at: Instant::now(),
        }))
    }

    /// Subscribe to the provider, start it, and spawn the event pump.
    /// The subscription is taken first so no early event is missed.
    async fn start_provider(state: &Arc<SharedState>) -> Result<JoinHandle<()>> {
        let events = state.provider.subscribe();
        let pump = tokio::spawn(run_event_pump(Arc::clone(state), events));
        state
            .provider
            .start()
            .await
            .with_context(|| format!("starting {} provider", state.provider.name()))?;
        Ok(pump)
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!("Server is running on http://{}", listener.local_addr()?);

        let _pump = Self::start_provider(&state).await?;
        serve(listener, state).await
    }

    /// Start the server and return the bound address, state, and task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let pump = Self::start_provider(&state).await?;
        let serve_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            let result = serve(listener, serve_state).await;
            pump.abort();
            result
        });
        Ok((addr, state, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    let router = crate::web::router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Apply provider events in order until the provider goes away.
async fn run_event_pump(state: Arc<SharedState>, mut events: broadcast::Receiver<ProviderEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => handle_provider_event(&state, event).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event pump lagged, skipped {n} provider event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!("Provider event stream closed");
                break;
            }
        }
    }
}

pub async fn handle_provider_event(state: &Arc<SharedState>, event: ProviderEvent) {
    match event {
        ProviderEvent::Ready => {
            state.set_connected(true);
            state.hub.publish(realtime::CONNECTION_EVENT, realtime::CONNECTED);
            tracing::info!("Connected");
        }
        ProviderEvent::RequireAction => {
            state.set_connected(false);
            match qr::read_data_url(&state.config.qr_path).await {
                Ok(url) => {
                    state.hub.publish(realtime::CONNECTION_EVENT, &url);
                }
                Err(e) => tracing::error!("Cannot broadcast QR: {e}"),
            }
            tracing::info!("Waiting for device link");
        }
        ProviderEvent::Message(msg) => handle_incoming(state, msg),
    }
}

/// Log the message and answer it from the flow. Answers go out on their own
/// task so a slow gateway never holds up link-state events behind it.
fn handle_incoming(state: &Arc<SharedState>, msg: IncomingMessage) {
    tracing::debug!(from = %msg.from, name = ?msg.push_name, "Inbound message");
    state.db.record(Direction::Inbound, &msg.from, &msg.body);

    let Some(answers) = state.flow.answers_for(&msg.body) else {
        return;
    };
    let answers = answers.to_vec();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        for answer in &answers {
            if let Err(e) = state.send(&msg.from, answer, &SendOptions::default()).await {
                tracing::warn!(to = %msg.from, "Flow answer failed: {e}");
                break;
            }
        }
    });
}
