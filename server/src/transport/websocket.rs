//! WebSocket (push) transport (spec.md §4.E.2).
//!
//! The transport is a WS *client* dialing out to the data provider. A
//! single long-lived connection is kept alive across `background_execute`
//! ticks — unlike the HTTP transport, a fresh connection isn't made per
//! tick. Ticks only recompute the subscription delta and, when the
//! connection looks unresponsive or absent, trigger a (re)connect. This
//! mirrors the connection-tracking shape of the teacher's
//! `realtime::websocket::ConnectionTracker`, adapted from "track inbound
//! client sockets" to "own one outbound socket per transport instance".

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Transport, TransportDeps, TransportResult};
use crate::cache::{now_unix_ms, Timestamps};
use crate::error::AdapterError;

pub type UrlFn = Arc<dyn Fn(&[serde_json::Value]) -> String + Send + Sync>;
pub type SubscribeMessageFn = Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>;
pub type MessageHandlerFn = Arc<dyn Fn(&str) -> Vec<TransportResult> + Send + Sync>;
pub type HeartbeatFn = Arc<dyn Fn() -> String + Send + Sync>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Unresponsive = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Open,
            3 => ConnState::Unresponsive,
            _ => ConnState::Disconnected,
        }
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<WsMessage>,
    subscribed: HashSet<String>,
    shutdown: mpsc::Sender<()>,
}

pub struct WebSocketTransport {
    deps: Arc<TransportDeps>,
    url: UrlFn,
    subscribe_message: SubscribeMessageFn,
    unsubscribe_message: SubscribeMessageFn,
    on_message: MessageHandlerFn,
    heartbeat: Option<HeartbeatFn>,

    connection: Mutex<Option<Connection>>,
    state: AtomicU8,
    last_message_at_ms: Arc<AtomicI64>,

    subscription_ttl_ms: u64,
    unresponsive_ttl_ms: u64,
    heartbeat_interval_ms: u64,
    min_period_ms: u64,
    /// TTL results pushed over this socket are cached with — `CACHE_MAX_AGE`,
    /// distinct from `subscription_ttl_ms` (spec.md §4.E.2 "each result's
    /// parameters are hashed to a cache key and written with CACHE_MAX_AGE").
    cache_max_age_ms: u64,
}

impl WebSocketTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: TransportDeps,
        url: UrlFn,
        subscribe_message: SubscribeMessageFn,
        unsubscribe_message: SubscribeMessageFn,
        on_message: MessageHandlerFn,
        heartbeat: Option<HeartbeatFn>,
        subscription_ttl_ms: u64,
        unresponsive_ttl_ms: u64,
        heartbeat_interval_ms: u64,
        cache_max_age_ms: u64,
        min_period_ms: u64,
    ) -> Self {
        Self {
            deps: Arc::new(deps),
            url,
            subscribe_message,
            unsubscribe_message,
            on_message,
            heartbeat,
            connection: Mutex::new(None),
            state: AtomicU8::new(ConnState::Disconnected as u8),
            last_message_at_ms: Arc::new(AtomicI64::new(now_unix_ms())),
            subscription_ttl_ms,
            unresponsive_ttl_ms,
            heartbeat_interval_ms,
            cache_max_age_ms,
            min_period_ms,
        }
    }

    fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_unresponsive(&self) -> bool {
        let last = self.last_message_at_ms.load(Ordering::SeqCst);
        now_unix_ms() - last > self.unresponsive_ttl_ms as i64
    }

    async fn connect(&self, desired_params: &[serde_json::Value]) -> Result<(), AdapterError> {
        self.set_state(ConnState::Connecting);
        let url = (self.url)(desired_params);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| AdapterError::Upstream(format!("Provider request failed: websocket connect error: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let deps = self.deps.clone();
        let on_message = self.on_message.clone();
        let cache_max_age_ms = self.cache_max_age_ms;
        let last_message_at_ms = self.last_message_at_ms.clone();

        // Writer + reader pump for this connection's lifetime.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        let _ = write.close().await;
                        break;
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(msg) => { if write.send(msg).await.is_err() { break; } }
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                last_message_at_ms.store(now_unix_ms(), Ordering::SeqCst);
                                for result in (on_message)(&text) {
                                    let key = deps.cache_key_for(&result.params);
                                    let timestamps = Timestamps {
                                        provider_data_requested: None,
                                        provider_data_received: Some(now_unix_ms()),
                                        provider_data_stream_established: Some(now_unix_ms()),
                                        provider_indicated_time: result.provider_indicated_time_unix_ms,
                                    };
                                    if let Err(e) = deps.cache.set(&key, result.value, cache_max_age_ms, timestamps).await {
                                        tracing::warn!(error = %e, "failed to cache websocket push result");
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "websocket read error");
                                break;
                            }
                        }
                    }
                }
            }
        });

        *self.connection.lock().await = Some(Connection { outbound: outbound_tx, subscribed: HashSet::new(), shutdown: shutdown_tx });
        self.set_state(ConnState::Open);
        self.last_message_at_ms.store(now_unix_ms(), Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            let _ = conn.shutdown.send(()).await;
        }
        self.set_state(ConnState::Disconnected);
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let Some(heartbeat) = self.heartbeat.clone() else { return };
        let this = self.clone();
        let interval = Duration::from_millis(self.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.state() != ConnState::Open {
                    continue;
                }
                let mut guard = this.connection.lock().await;
                if let Some(conn) = guard.as_mut() {
                    if conn.outbound.send(WsMessage::Text(heartbeat())).is_err() {
                        tracing::warn!("heartbeat send failed, connection will be treated as unresponsive");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        &self.deps.transport_name
    }

    async fn register_request(&self, input: &serde_json::Value) -> Result<(), AdapterError> {
        let key = self.deps.cache_key_for(input);
        self.deps.subscriptions.add(&key, input.clone(), self.subscription_ttl_ms).await
    }

    async fn background_execute(&self) -> Result<(), AdapterError> {
        let subscribed = self.deps.subscriptions.get_all().await?;
        let desired_params: Vec<serde_json::Value> = subscribed.iter().map(|e| e.value.clone()).collect();
        let desired_keys: HashSet<String> = subscribed.iter().map(|e| e.key.clone()).collect();

        if self.state() == ConnState::Open && self.is_unresponsive() && !desired_keys.is_empty() {
            tracing::warn!("websocket unresponsive, reconnecting");
            self.disconnect().await;
        }

        if self.state() != ConnState::Open {
            if desired_keys.is_empty() {
                return Ok(());
            }
            self.connect(&desired_params).await?;
        }

        let (new_keys, stale_keys) = {
            let guard = self.connection.lock().await;
            let Some(conn) = guard.as_ref() else { return Ok(()) };
            let new: Vec<String> = desired_keys.difference(&conn.subscribed).cloned().collect();
            let stale: Vec<String> = conn.subscribed.difference(&desired_keys).cloned().collect();
            (new, stale)
        };

        let by_key: std::collections::HashMap<String, serde_json::Value> =
            subscribed.into_iter().map(|e| (e.key, e.value)).collect();

        for key in &new_keys {
            if let Some(params) = by_key.get(key) {
                let msg = (self.subscribe_message)(params);
                let mut guard = self.connection.lock().await;
                if let Some(conn) = guard.as_mut() {
                    let _ = conn.outbound.send(WsMessage::Text(msg));
                    conn.subscribed.insert(key.clone());
                }
            }
        }
        for key in &stale_keys {
            let msg = (self.unsubscribe_message)(&serde_json::json!({ "key": key }));
            let mut guard = self.connection.lock().await;
            if let Some(conn) = guard.as_mut() {
                let _ = conn.outbound.send(WsMessage::Text(msg));
                conn.subscribed.remove(key);
            }
        }

        Ok(())
    }

    fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }
}

/// Must be called once after wrapping the transport in an `Arc` so the
/// heartbeat task can hold a cloneable handle back to `self`.
pub fn start_heartbeat(transport: &Arc<WebSocketTransport>) {
    transport.spawn_heartbeat();
}
