//! Provider backed by an Evolution API gateway.
//!
//! Evolution API runs the Baileys WhatsApp Web client and exposes it over
//! REST plus webhooks. This provider:
//!
//! 1. creates (or reconnects) a named instance and saves the pairing QR as a
//!    PNG at the configured path
//! 2. polls `connectionState` to notice when a phone links or drops
//! 3. turns webhook payloads (`qrcode.updated`, `connection.update`,
//!    `messages.upsert`) into [`ProviderEvent`]s
//!
//! The QR file is the only artifact shared with the server: every
//! [`ProviderEvent::RequireAction`] is emitted after the new image is on disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::ProviderError;
use crate::event::{IncomingMessage, ProviderEvent};
use crate::provider::{EVENT_CAPACITY, Provider, SendOptions};

/// Connection states the gateway reports for a linked device.
const LINKED_STATES: [&str; 2] = ["open", "connected"];

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    /// Gateway base URL, e.g. `http://127.0.0.1:8080`.
    pub api_url: String,
    /// Sent as the `apikey` header when set.
    pub api_key: Option<String>,
    pub instance_name: String,
    /// Where the pairing QR PNG is written.
    pub qr_path: PathBuf,
    pub poll_interval: Duration,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            instance_name: "wagate".to_string(),
            qr_path: PathBuf::from("bot.qr.png"),
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct EvolutionProvider {
    inner: Arc<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: EvolutionConfig,
    client: reqwest::Client,
    events: broadcast::Sender<ProviderEvent>,
    link: Mutex<LinkState>,
}

#[derive(Debug, Default)]
struct LinkState {
    linked: bool,
    /// Bumped on every recorded link. A QR fetched under an older epoch is
    /// stale and must not be announced.
    epoch: u64,
    /// Last QR published, to avoid re-announcing the same code every poll.
    last_qr: Option<String>,
}

impl EvolutionProvider {
    pub fn new(config: EvolutionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                client: reqwest::Client::new(),
                events,
                link: Mutex::new(LinkState::default()),
            }),
            poller: Mutex::new(None),
        }
    }
}

impl Drop for EvolutionProvider {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Provider for EvolutionProvider {
    fn name(&self) -> &'static str {
        "evolution"
    }

    async fn start(&self) -> Result<(), ProviderError> {
        let inner = Arc::clone(&self.inner);
        tracing::info!(
            instance = %inner.config.instance_name,
            url = %inner.config.api_url,
            "Starting Evolution API session"
        );

        let epoch = inner.link_epoch();
        if let Some(qr) = inner.create_instance().await? {
            inner.publish_qr(&qr, epoch).await?;
        }

        let poll_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_inner.config.poll_interval);
            interval.tick().await; // skip first immediate tick
            loop {
                interval.tick().await;
                poll_inner.poll_once().await;
            }
        });
        if let Some(old) = self.poller.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    async fn send_message(
        &self,
        phone: &str,
        message: &str,
        options: &SendOptions,
    ) -> Result<(), ProviderError> {
        let number = normalize_number(phone);
        if number.is_empty() {
            return Err(ProviderError::InvalidNumber(phone.to_string()));
        }
        let instance = &self.inner.config.instance_name;
        let (path, body) = match options.media {
            Some(ref media) => (
                format!("/message/sendMedia/{instance}"),
                json!({
                    "number": number,
                    "mediatype": "image",
                    "media": media,
                    "caption": message,
                }),
            ),
            None => (
                format!("/message/sendText/{instance}"),
                json!({ "number": number, "text": message }),
            ),
        };

        let resp = self
            .inner
            .request(reqwest::Method::POST, &path)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%number, %status, "Gateway refused message");
            return Err(ProviderError::Rejected { status: status.as_u16(), body });
        }
        tracing::debug!(%number, "Message handed to gateway");
        Ok(())
    }

    async fn ingest_webhook(&self, payload: &Value) -> bool {
        let Some(event) = parse_webhook(payload) else {
            return true;
        };
        match event {
            WebhookEvent::Qr(qr) => {
                let epoch = self.inner.link_epoch();
                if let Err(e) = self.inner.publish_qr(&qr, epoch).await {
                    tracing::error!("Failed to store QR from webhook: {e}");
                }
            }
            WebhookEvent::Connection(state) => {
                if is_linked_state(&state) {
                    self.inner.mark_linked();
                } else if state == "close" {
                    self.inner.mark_unlinked();
                }
            }
            WebhookEvent::Messages(messages) => {
                for msg in messages {
                    let _ = self.inner.events.send(ProviderEvent::Message(msg));
                }
            }
        }
        true
    }
}

impl Inner {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let builder = self.client.request(method, url);
        match self.config.api_key {
            Some(ref key) => builder.header("apikey", key),
            None => builder,
        }
    }

    /// Create the instance, falling back to connect when it already exists.
    /// Returns the pairing QR, if the gateway handed one out.
    async fn create_instance(&self) -> Result<Option<String>, ProviderError> {
        let body = json!({
            "instanceName": self.config.instance_name,
            "integration": "WHATSAPP-BAILEYS",
            "qrcode": true,
        });
        let resp = self
            .request(reqwest::Method::POST, "/instance/create")
            .json(&body)
            .send()
            .await?;
        match read_json(resp).await {
            Ok(body) => Ok(extract_qr(&body)),
            Err(ProviderError::Rejected { status, body }) if instance_exists(status, &body) => {
                tracing::info!("Instance already exists, connecting");
                self.connect_instance().await
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_instance(&self) -> Result<Option<String>, ProviderError> {
        let path = format!("/instance/connect/{}", self.config.instance_name);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let body = read_json(resp).await?;
        Ok(extract_qr(&body))
    }

    async fn connection_state(&self) -> Result<String, ProviderError> {
        let path = format!("/instance/connectionState/{}", self.config.instance_name);
        let resp = self.request(reqwest::Method::GET, &path).send().await?;
        let body = read_json(resp).await?;
        let state = body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .unwrap_or("");
        Ok(state.to_string())
    }

    async fn poll_once(&self) {
        let epoch = self.link_epoch();
        match self.connection_state().await {
            Ok(state) if is_linked_state(&state) => self.mark_linked(),
            Ok(state) => {
                tracing::debug!(%state, "Device not linked");
                if self.link.lock().linked {
                    self.mark_unlinked();
                }
                match self.connect_instance().await {
                    Ok(Some(qr)) => {
                        if let Err(e) = self.publish_qr(&qr, epoch).await {
                            tracing::error!("Failed to store QR: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("QR refresh failed: {e}"),
                }
            }
            Err(e) => tracing::warn!("Connection check failed: {e}"),
        }
    }

    fn link_epoch(&self) -> u64 {
        self.link.lock().epoch
    }

    /// Record a link. Events are sent under the lock so `Ready` and
    /// `RequireAction` leave in the order the state changed.
    fn mark_linked(&self) {
        let mut link = self.link.lock();
        if link.linked {
            return;
        }
        link.linked = true;
        link.epoch += 1;
        link.last_qr = None;
        tracing::info!("Device linked");
        let _ = self.events.send(ProviderEvent::Ready);
    }

    fn mark_unlinked(&self) {
        let mut link = self.link.lock();
        link.linked = false;
        link.last_qr = None;
    }

    /// Write the QR image to disk, then announce it. `epoch` is the link
    /// epoch observed when the QR was received; if a link was recorded since,
    /// the QR is stale and dropped. Repeats of the code on disk are ignored.
    async fn publish_qr(&self, qr: &str, epoch: u64) -> Result<(), ProviderError> {
        {
            let link = self.link.lock();
            if link.epoch != epoch {
                tracing::debug!("Dropping QR received before the last link");
                return Ok(());
            }
            if !link.linked && link.last_qr.as_deref() == Some(qr) {
                return Ok(());
            }
        }
        let png = decode_qr(qr)?;
        tokio::fs::write(&self.config.qr_path, &png).await?;

        let mut link = self.link.lock();
        if link.epoch != epoch {
            tracing::debug!("Linked while the QR was being stored; not announcing it");
            return Ok(());
        }
        link.linked = false;
        link.last_qr = Some(qr.to_string());
        tracing::info!(path = %self.config.qr_path.display(), "QR code updated, waiting for scan");
        let _ = self.events.send(ProviderEvent::RequireAction);
        Ok(())
    }
}

/// Decode a gateway JSON response, turning non-2xx answers into `Rejected`.
async fn read_json(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Rejected { status: status.as_u16(), body: text });
    }
    Ok(serde_json::from_str(&text)?)
}

/// The gateway answers `403 This name "…" is already in use.` when the
/// instance was created on an earlier run.
fn instance_exists(status: u16, body: &str) -> bool {
    matches!(status, 403 | 409)
        && (body.contains("already in use") || body.contains("already exists"))
}

/// A webhook payload reduced to what the provider acts on.
#[derive(Debug, PartialEq, Eq)]
enum WebhookEvent {
    Qr(String),
    Connection(String),
    Messages(Vec<IncomingMessage>),
}

fn parse_webhook(payload: &Value) -> Option<WebhookEvent> {
    let data = &payload["data"];
    match payload["event"].as_str()? {
        "qrcode.updated" => data["qrcode"]["base64"]
            .as_str()
            .or_else(|| data["qrcode"].as_str())
            .filter(|qr| !qr.is_empty())
            .map(|qr| WebhookEvent::Qr(qr.to_string())),
        "connection.update" => data["state"]
            .as_str()
            .map(|state| WebhookEvent::Connection(state.to_string())),
        "messages.upsert" => {
            let items = match data.as_array() {
                Some(arr) => arr.iter().collect::<Vec<_>>(),
                None => vec![data],
            };
            let messages: Vec<_> = items.into_iter().filter_map(parse_message).collect();
            (!messages.is_empty()).then_some(WebhookEvent::Messages(messages))
        }
        _ => None,
    }
}

fn parse_message(msg: &Value) -> Option<IncomingMessage> {
    let key = &msg["key"];
    if key["fromMe"].as_bool().unwrap_or(false) {
        return None;
    }
    let body = msg["message"]["conversation"]
        .as_str()
        .or_else(|| msg["message"]["extendedTextMessage"]["text"].as_str())
        .filter(|t| !t.is_empty())?;
    let from = normalize_number(key["remoteJid"].as_str()?);
    if from.is_empty() {
        return None;
    }
    Some(IncomingMessage {
        from,
        body: body.to_string(),
        push_name: msg["pushName"].as_str().map(str::to_string),
    })
}

fn extract_qr(body: &Value) -> Option<String> {
    body["base64"]
        .as_str()
        .or_else(|| body["qrcode"]["base64"].as_str())
        .or_else(|| body["qrcode"].as_str())
        .filter(|qr| !qr.is_empty())
        .map(str::to_string)
}

fn is_linked_state(state: &str) -> bool {
    LINKED_STATES.contains(&state)
}

/// Reduce a phone number or JID to the digits the gateway expects.
/// Group JIDs (`…@g.us`) are passed through untouched.
pub fn normalize_number(raw: &str) -> String {
    let raw = raw.trim();
    if raw.ends_with("@g.us") {
        return raw.to_string();
    }
    let local = raw.split('@').next().unwrap_or_default();
    local.chars().filter(char::is_ascii_digit).collect()
}

/// Decode a QR image given either as raw base64 or as a `data:` URL.
pub fn decode_qr(qr: &str) -> Result<Vec<u8>, ProviderError> {
    let encoded = match qr.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ProviderError::InvalidQr("data URL without payload".to_string()))?,
        None => qr,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProviderError::InvalidQr(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn png_b64() -> String {
        base64::engine::general_purpose::STANDARD.encode(PNG_MAGIC)
    }

    fn provider_in(dir: &tempfile::TempDir) -> EvolutionProvider {
        EvolutionProvider::new(EvolutionConfig {
            qr_path: dir.path().join("bot.qr.png"),
            ..Default::default()
        })
    }

    #[test]
    fn only_duplicate_name_rejections_mean_existing_instance() {
        assert!(instance_exists(403, ALREADY_IN_USE));
        assert!(instance_exists(409, "instance already exists"));
        assert!(!instance_exists(401, "API key does not exists"));
        assert!(!instance_exists(403, "Forbidden"));
        assert!(!instance_exists(500, "already in use"));
    }

    #[test]
    fn normalizes_numbers_and_jids() {
        assert_eq!(normalize_number("+34 600-123-456"), "34600123456");
        assert_eq!(normalize_number("5491122334455@s.whatsapp.net"), "5491122334455");
        assert_eq!(normalize_number("5491122334455@c.us"), "5491122334455");
        assert_eq!(normalize_number("120363-42@g.us"), "120363-42@g.us");
        assert_eq!(normalize_number("  "), "");
    }

    #[test]
    fn decodes_raw_and_data_url_qr() {
        let raw = png_b64();
        assert_eq!(decode_qr(&raw).unwrap(), PNG_MAGIC);
        let url = format!("data:image/png;base64,{raw}");
        assert_eq!(decode_qr(&url).unwrap(), PNG_MAGIC);
        assert!(matches!(decode_qr("data:image/png;base64"), Err(ProviderError::InvalidQr(_))));
        assert!(matches!(decode_qr("not base64!"), Err(ProviderError::InvalidQr(_))));
    }

    #[test]
    fn extracts_qr_from_create_and_connect_responses() {
        let create = json!({ "instance": {}, "qrcode": { "base64": "AAA" } });
        assert_eq!(extract_qr(&create).as_deref(), Some("AAA"));
        let connect = json!({ "pairingCode": null, "base64": "BBB" });
        assert_eq!(extract_qr(&connect).as_deref(), Some("BBB"));
        assert_eq!(extract_qr(&json!({ "base64": "" })), None);
        assert_eq!(extract_qr(&json!({})), None);
    }

    #[test]
    fn parses_qr_and_connection_webhooks() {
        let qr = json!({ "event": "qrcode.updated", "data": { "qrcode": { "base64": "CCC" } } });
        assert_eq!(parse_webhook(&qr), Some(WebhookEvent::Qr("CCC".into())));

        let conn = json!({ "event": "connection.update", "data": { "state": "open" } });
        assert_eq!(parse_webhook(&conn), Some(WebhookEvent::Connection("open".into())));

        assert_eq!(parse_webhook(&json!({ "event": "presence.update", "data": {} })), None);
        assert_eq!(parse_webhook(&json!({ "data": {} })), None);
    }

    #[test]
    fn parses_inbound_messages_and_skips_own() {
        let payload = json!({
            "event": "messages.upsert",
            "data": [
                {
                    "key": { "remoteJid": "34600111222@s.whatsapp.net", "fromMe": false },
                    "pushName": "Ana",
                    "message": { "conversation": "hola" }
                },
                {
                    "key": { "remoteJid": "34600111222@s.whatsapp.net", "fromMe": true },
                    "message": { "conversation": "echo" }
                },
                {
                    "key": { "remoteJid": "34600333444@s.whatsapp.net", "fromMe": false },
                    "message": { "extendedTextMessage": { "text": "precio" } }
                },
                {
                    "key": { "remoteJid": "34600333444@s.whatsapp.net" },
                    "message": { "imageMessage": {} }
                }
            ]
        });
        let Some(WebhookEvent::Messages(msgs)) = parse_webhook(&payload) else {
            panic!("expected messages");
        };
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].from, "34600111222");
        assert_eq!(msgs[0].body, "hola");
        assert_eq!(msgs[0].push_name.as_deref(), Some("Ana"));
        assert_eq!(msgs[1].body, "precio");
        assert_eq!(msgs[1].push_name, None);
    }

    #[tokio::test]
    async fn publish_qr_writes_png_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        let mut rx = provider.subscribe();

        provider.inner.publish_qr(&png_b64(), 0).await.unwrap();
        provider.inner.publish_qr(&png_b64(), 0).await.unwrap();

        let written = std::fs::read(dir.path().join("bot.qr.png")).unwrap();
        assert_eq!(written, PNG_MAGIC);
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
        assert!(rx.try_recv().is_err(), "same QR must not be announced twice");
    }

    #[tokio::test]
    async fn webhooks_drive_link_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        let mut rx = provider.subscribe();

        let open = json!({ "event": "connection.update", "data": { "state": "open" } });
        assert!(provider.ingest_webhook(&open).await);
        assert!(provider.ingest_webhook(&open).await);
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::Ready);
        assert!(rx.try_recv().is_err(), "ready is emitted once per link");

        let close = json!({ "event": "connection.update", "data": { "state": "close" } });
        assert!(provider.ingest_webhook(&close).await);
        assert!(!provider.inner.link.lock().linked);

        assert!(provider.ingest_webhook(&open).await);
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::Ready);
    }

    #[tokio::test]
    async fn message_webhook_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        let mut rx = provider.subscribe();

        let payload = json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "111@s.whatsapp.net", "fromMe": false },
                "message": { "conversation": "hi" }
            }
        });
        assert!(provider.ingest_webhook(&payload).await);
        let ProviderEvent::Message(msg) = rx.try_recv().unwrap() else {
            panic!("expected message event");
        };
        assert_eq!(msg.from, "111");
        assert_eq!(msg.body, "hi");
    }

    #[tokio::test]
    async fn qr_then_open_webhooks_end_linked() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        let mut rx = provider.subscribe();

        let qr = json!({
            "event": "qrcode.updated",
            "data": { "qrcode": { "base64": png_b64() } }
        });
        let open = json!({ "event": "connection.update", "data": { "state": "open" } });
        assert!(provider.ingest_webhook(&qr).await);
        assert!(provider.ingest_webhook(&open).await);

        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::Ready);
        assert!(rx.try_recv().is_err());
        assert!(provider.inner.link.lock().linked);
    }

    #[tokio::test]
    async fn qr_received_before_link_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(&dir);
        let mut rx = provider.subscribe();

        let epoch = provider.inner.link_epoch();
        provider.inner.mark_linked();
        provider.inner.publish_qr(&png_b64(), epoch).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::Ready);
        assert!(rx.try_recv().is_err(), "stale QR must not unlink");
        assert!(provider.inner.link.lock().linked);
        assert!(!dir.path().join("bot.qr.png").exists());
    }

    // ── Against a stand-in gateway ─────────────────────────────────────

    use std::collections::HashMap;

    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        apikey: Option<String>,
        body: String,
    }

    /// Canned responses keyed by `"METHOD /path"`; unknown routes get 404.
    #[derive(Clone, Default)]
    struct Gateway {
        routes: Arc<Mutex<HashMap<String, (u16, String)>>>,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    impl Gateway {
        fn reply(&self, route: &str, status: u16, body: impl Into<String>) {
            self.routes.lock().insert(route.to_string(), (status, body.into()));
        }

        fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().clone()
        }

        fn paths(&self) -> Vec<String> {
            self.requests().into_iter().map(|r| format!("{} {}", r.method, r.path)).collect()
        }
    }

    async fn answer(
        State(gw): State<Gateway>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> (StatusCode, String) {
        let key = format!("{method} {}", uri.path());
        gw.requests.lock().push(Recorded {
            method: method.to_string(),
            path: uri.path().to_string(),
            apikey: headers.get("apikey").and_then(|v| v.to_str().ok()).map(str::to_string),
            body,
        });
        let (status, text) = gw
            .routes
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or((404, "{}".to_string()));
        (StatusCode::from_u16(status).unwrap(), text)
    }

    async fn spawn_gateway() -> (Gateway, String) {
        let gw = Gateway::default();
        let app = axum::Router::new().fallback(answer).with_state(gw.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (gw, format!("http://{addr}"))
    }

    fn gateway_provider(dir: &tempfile::TempDir, api_url: String) -> EvolutionProvider {
        EvolutionProvider::new(EvolutionConfig {
            api_url,
            api_key: Some("s3cret".to_string()),
            qr_path: dir.path().join("bot.qr.png"),
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        })
    }

    const ALREADY_IN_USE: &str = r#"{"status":403,"error":"Forbidden","response":
        {"message":["This name \"wagate\" is already in use."]}}"#;

    fn qr_body(png: &[u8]) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(png);
        json!({ "base64": format!("data:image/png;base64,{b64}") }).to_string()
    }

    #[tokio::test]
    async fn sends_text_and_media_with_api_key() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /message/sendText/wagate", 201, r#"{"key":{"id":"1"}}"#);
        gw.reply("POST /message/sendMedia/wagate", 201, r#"{"key":{"id":"2"}}"#);
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);

        provider
            .send_message("+34 600-111-222", "hola", &SendOptions::default())
            .await
            .unwrap();
        let media = SendOptions { media: Some("https://example.com/a.jpg".to_string()) };
        provider.send_message("34600111222@s.whatsapp.net", "mira", &media).await.unwrap();

        let reqs = gw.requests();
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.apikey.as_deref() == Some("s3cret")));

        assert_eq!(reqs[0].path, "/message/sendText/wagate");
        let text: Value = serde_json::from_str(&reqs[0].body).unwrap();
        assert_eq!(text, json!({ "number": "34600111222", "text": "hola" }));

        assert_eq!(reqs[1].path, "/message/sendMedia/wagate");
        let sent: Value = serde_json::from_str(&reqs[1].body).unwrap();
        assert_eq!(
            sent,
            json!({
                "number": "34600111222",
                "mediatype": "image",
                "media": "https://example.com/a.jpg",
                "caption": "mira",
            })
        );
    }

    #[tokio::test]
    async fn refused_send_is_rejected() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /message/sendText/wagate", 500, "boom");
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);

        let err = provider
            .send_message("34600111222", "hola", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProviderError::Rejected { status: 500, ref body } if body == "boom"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn existing_instance_falls_back_to_connect() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /instance/create", 403, ALREADY_IN_USE);
        gw.reply("GET /instance/connect/wagate", 200, qr_body(PNG_MAGIC));
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);
        let mut rx = provider.subscribe();

        provider.start().await.unwrap();

        assert_eq!(gw.paths(), ["POST /instance/create", "GET /instance/connect/wagate"]);
        let create: Value = serde_json::from_str(&gw.requests()[0].body).unwrap();
        assert_eq!(create["integration"], "WHATSAPP-BAILEYS");
        assert_eq!(create["qrcode"], true);
        assert_eq!(std::fs::read(dir.path().join("bot.qr.png")).unwrap(), PNG_MAGIC);
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
    }

    #[tokio::test]
    async fn failed_connect_after_existing_instance_fails_start() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /instance/create", 403, ALREADY_IN_USE);
        gw.reply("GET /instance/connect/wagate", 401, r#"{"message":"Unauthorized"}"#);
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);

        let err = provider.start().await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 401, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unrelated_create_rejection_does_not_connect() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /instance/create", 401, r#"{"message":"API key does not exists"}"#);
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);

        let err = provider.start().await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 401, .. }), "got {err:?}");
        assert_eq!(gw.paths(), ["POST /instance/create"]);
    }

    #[tokio::test]
    async fn malformed_create_response_fails_start() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("POST /instance/create", 201, "<html>gateway</html>");
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);

        let err = provider.start().await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn polling_tracks_link_and_refreshed_qr() {
        let (gw, url) = spawn_gateway().await;
        let dir = tempfile::tempdir().unwrap();
        let qr_file = dir.path().join("bot.qr.png");
        let provider = gateway_provider(&dir, url);
        let mut rx = provider.subscribe();
        let second = [PNG_MAGIC, b"2"].concat();

        gw.reply("GET /instance/connectionState/wagate", 200, r#"{"instance":{"state":"close"}}"#);
        gw.reply("GET /instance/connect/wagate", 200, qr_body(PNG_MAGIC));
        provider.inner.poll_once().await;
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
        provider.inner.poll_once().await;
        assert!(rx.try_recv().is_err(), "unchanged QR is not re-announced");

        gw.reply("GET /instance/connect/wagate", 200, qr_body(&second));
        provider.inner.poll_once().await;
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
        assert_eq!(std::fs::read(&qr_file).unwrap(), second);

        gw.reply("GET /instance/connectionState/wagate", 200, r#"{"instance":{"state":"open"}}"#);
        provider.inner.poll_once().await;
        provider.inner.poll_once().await;
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::Ready);
        assert!(rx.try_recv().is_err(), "ready is emitted once per link");

        gw.reply("GET /instance/connectionState/wagate", 200, r#"{"instance":{"state":"close"}}"#);
        provider.inner.poll_once().await;
        assert_eq!(rx.try_recv().unwrap(), ProviderEvent::RequireAction);
        assert!(!provider.inner.link.lock().linked);
    }

    #[tokio::test]
    async fn rejected_state_check_changes_nothing() {
        let (gw, url) = spawn_gateway().await;
        gw.reply("GET /instance/connectionState/wagate", 401, "nope");
        let dir = tempfile::tempdir().unwrap();
        let provider = gateway_provider(&dir, url);
        let mut rx = provider.subscribe();

        provider.inner.poll_once().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gw.paths(), ["GET /instance/connectionState/wagate"]);
    }
}
