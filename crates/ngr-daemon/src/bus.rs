//! The persistent bidirectional event link to the control plane.
//!
//! One [`WebsocketBus`] owns one websocket at a time. A single reader task
//! decodes inbound text frames into [`Event`]s and fans each one out to all
//! subscribers, every invocation on its own task so a slow subscriber never
//! blocks the reader. The write half sits behind a mutex so concurrent
//! publishers are serialized; publishing while disconnected logs and drops
//! the event, there is no outbound buffering.
//!
//! The connect loop redials every five seconds until cancelled. After every
//! successful dial a local [`events::ConnectionCreated`] is fanned out, which
//! drives the first-contact handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ngr_core::events::{self, Event};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const RETRY_DELAY: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A subscriber: takes the event, returns the future that handles it.
pub type Subscriber = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

type SubscriberMap = Arc<Mutex<HashMap<u64, Subscriber>>>;

/// Anything events can be published into.
///
/// The bus is the production sink; tests record instead.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes one event. Delivery is best-effort by design.
    async fn publish(&self, event: Event);
}

/// The auto-reconnecting websocket bus.
pub struct WebsocketBus {
    url: String,
    token: String,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    subscribers: SubscriberMap,
    next_handle: AtomicU64,
}

/// Handle returned by [`WebsocketBus::subscribe`]; closing it removes the
/// subscriber again.
pub struct Subscription {
    id: u64,
    subscribers: SubscriberMap,
}

impl Subscription {
    /// Removes the subscriber from the bus.
    pub fn close(self) {
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .remove(&self.id);
    }
}

impl WebsocketBus {
    /// A bus for the given websocket URL and bearer token. Nothing is dialed
    /// until [`WebsocketBus::run`].
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            writer: tokio::sync::Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Registers a subscriber invoked for every inbound event.
    pub fn subscribe(&self, subscriber: Subscriber) -> Subscription {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(id, subscriber);

        Subscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Serializes and sends one event over the current connection.
    ///
    /// Logs and drops the event when disconnected or when the write fails;
    /// the read loop notices broken connections on its own.
    pub async fn publish(&self, event: &Event) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to marshal websocket json message");
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            error!("websocket connection is gone");
            return;
        };

        if let Err(err) = sink.send(Message::Text(frame)).await {
            error!(%err, "failed to write websocket json message");
        }
    }

    /// Runs the connect-read-reconnect loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                () = cancel.cancelled() => {
                    info!("interrupt received during dial, exiting");
                    return;
                }
                res = self.connect() => match res {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!(%err, retry_in = ?RETRY_DELAY, "connection failed");
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(RETRY_DELAY) => continue,
                        }
                    }
                }
            };

            info!("connected, listening for messages");
            let (sink, source) = stream.split();
            *self.writer.lock().await = Some(sink);

            // drives the first-contact handshake
            self.fan_out(Event::ConnectionCreated(events::ConnectionCreated {}));

            let cancelled = self.read_messages(source, &cancel).await;

            let mut writer = self.writer.lock().await;
            if cancelled {
                if let Some(sink) = writer.as_mut() {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                }
            }
            *writer = None;

            if cancelled {
                return;
            }
        }
    }

    /// Reads frames until the connection breaks or `cancel` fires. Returns
    /// whether the exit was caused by cancellation.
    async fn read_messages(&self, mut source: WsSource, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("stopping message reader");
                    return true;
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.notify(&text),
                    Some(Ok(_)) => {
                        // pings are answered by the protocol layer; other
                        // frame kinds carry nothing for us
                    }
                    Some(Err(err)) => {
                        error!(%err, "read error");
                        return false;
                    }
                    None => {
                        error!("connection closed by remote");
                        return false;
                    }
                }
            }
        }
    }

    fn notify(&self, frame: &str) {
        match serde_json::from_str::<Event>(frame) {
            Ok(event) => self.fan_out(event),
            Err(err) => error!(%err, "failed to unmarshal websocket event"),
        }
    }

    fn fan_out(&self, event: Event) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .values()
            .cloned()
            .collect();

        for subscriber in subscribers {
            let event = event.clone();
            tokio::spawn(subscriber(event));
        }
    }

    async fn connect(&self) -> anyhow::Result<WsStream> {
        info!(url = %self.url, "connecting to websocket");

        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))?,
        );

        let (stream, _response) = connect_async(request).await?;
        Ok(stream)
    }
}

#[async_trait]
impl EventSink for WebsocketBus {
    async fn publish(&self, event: Event) {
        Self::publish(self, &event).await;
    }
}
