use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use shared::domain::UserId;
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    error::ClientError,
    subscribers::{InboundFrame, SubscriberRegistry, Subscription},
    transport::{
        CloseInfo, Connector, TransportCommand, TransportEvent, TransportLink, NORMAL_CLOSURE,
    },
};

/// Session values that front-ends produce when no user is signed in.
const SENTINEL_SESSION_IDS: &[&str] = &["undefined", "null", "none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub step_ms: u64,
    pub max_delay_ms: u64,
    pub cooldown_ms: u64,
    /// Stop after the retry budget instead of entering the cooldown cycle.
    pub give_up_after_exhausted: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            step_ms: 1000,
            max_delay_ms: 5000,
            cooldown_ms: 10_000,
            give_up_after_exhausted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry after `delay`; the counter becomes `next_retry_count`.
    Retry {
        delay: Duration,
        next_retry_count: u32,
    },
    /// Budget exhausted: retry once after the cooldown and reset the counter.
    Cooldown { delay: Duration },
    GiveUp,
}

impl ReconnectPolicy {
    pub fn decide(&self, retry_count: u32) -> ReconnectDecision {
        if retry_count < self.max_retries {
            let delay_ms = self
                .base_delay_ms
                .saturating_add(u64::from(retry_count).saturating_mul(self.step_ms))
                .min(self.max_delay_ms);
            ReconnectDecision::Retry {
                delay: Duration::from_millis(delay_ms),
                next_retry_count: retry_count + 1,
            }
        } else if self.give_up_after_exhausted {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::Cooldown {
                delay: Duration::from_millis(self.cooldown_ms),
            }
        }
    }
}

/// Parses the session identifier a socket is opened for. Empty values and
/// front-end sentinels are rejected.
pub fn parse_session_id(raw: &str) -> Result<UserId, ClientError> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || SENTINEL_SESSION_IDS
            .iter()
            .any(|sentinel| trimmed.eq_ignore_ascii_case(sentinel))
    {
        return Err(ClientError::InvalidSession(raw.to_string()));
    }
    trimmed
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| ClientError::InvalidSession(raw.to_string()))
}

struct ActiveLink {
    generation: u64,
    /// Present once the transport has opened.
    outbound: Option<tokio::sync::mpsc::UnboundedSender<TransportCommand>>,
    driver: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    session: Option<UserId>,
    retry_count: u32,
    generation: u64,
    link: Option<ActiveLink>,
    reconnect_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

/// Owns the single transport of a chat session and keeps it alive.
pub struct ConnectionManager {
    settings: ClientSettings,
    connector: Arc<dyn Connector>,
    subscribers: SubscriberRegistry,
    status: watch::Sender<ConnectionStatus>,
    inner: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(settings: ClientSettings, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            settings,
            connector,
            subscribers: SubscriberRegistry::new(),
            status,
            inner: Mutex::new(ManagerState::default()),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn session(&self) -> Option<UserId> {
        self.lock().session
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn is_open(&self) -> bool {
        self.lock()
            .link
            .as_ref()
            .is_some_and(|link| link.outbound.is_some())
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn connect(self: &Arc<Self>, session_id: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.link.is_some() {
            debug!(session_id, "ws: transport already present, connect ignored");
            return Ok(());
        }

        let user_id = match parse_session_id(session_id) {
            Ok(user_id) => user_id,
            Err(err) => {
                error!(session_id, "ws: refusing to connect with invalid session id");
                self.status.send_replace(ConnectionStatus::Error);
                return Err(err);
            }
        };
        state.session = Some(user_id);
        self.open_link(&mut state, user_id)
    }

    pub fn disconnect(&self) {
        let mut state = self.lock();
        self.tear_down(&mut state);
        state.session = None;
        state.retry_count = 0;
        self.status.send_replace(ConnectionStatus::Disconnected);
        info!("ws: disconnected");
    }

    /// Drops the current transport and connects again for the same session
    /// after a short delay. The session stays active meanwhile, so sends are
    /// deferred rather than rejected.
    pub fn reconnect(self: &Arc<Self>) {
        let mut state = self.lock();
        let Some(user_id) = state.session else {
            debug!("ws: reconnect requested without an active session");
            return;
        };
        self.tear_down(&mut state);
        state.retry_count = 0;
        self.status.send_replace(ConnectionStatus::Disconnected);

        let delay = self.settings.manual_reconnect_delay();
        let generation = state.generation;
        let manager = Arc::clone(self);
        state.reconnect_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            manager.resume(generation, user_id);
        }));
        info!(user_id = user_id.0, delay_ms = delay.as_millis() as u64, "ws: reconnect scheduled");
    }

    /// Queues a text frame on the open transport.
    pub fn transmit(&self, text: String) -> Result<(), ClientError> {
        let state = self.lock();
        let outbound = state
            .link
            .as_ref()
            .and_then(|link| link.outbound.as_ref())
            .ok_or(ClientError::NotConnected)?;
        outbound
            .send(TransportCommand::Text(text))
            .map_err(|_| ClientError::TransportClosed)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels pending timers and closes the transport, leaving the session
    /// untouched. Tasks of the old transport become stale.
    fn tear_down(&self, state: &mut ManagerState) {
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = state.heartbeat_task.take() {
            task.abort();
        }
        if let Some(link) = state.link.take() {
            if let Some(outbound) = link.outbound {
                let _ = outbound.send(TransportCommand::Close(NORMAL_CLOSURE));
            }
            link.driver.abort();
        }
        state.generation += 1;
    }

    fn open_link(
        self: &Arc<Self>,
        state: &mut ManagerState,
        user_id: UserId,
    ) -> Result<(), ClientError> {
        let url = match self.settings.ws_endpoint(user_id) {
            Ok(url) => url,
            Err(err) => {
                error!(%err, "ws: cannot build socket endpoint");
                self.status.send_replace(ConnectionStatus::Error);
                return Err(err);
            }
        };

        state.generation += 1;
        let generation = state.generation;
        self.status.send_replace(ConnectionStatus::Connecting);
        info!(user_id = user_id.0, %url, "ws: connecting");

        let manager = Arc::clone(self);
        let driver = tokio::spawn(async move { manager.drive_link(generation, url).await });
        state.link = Some(ActiveLink {
            generation,
            outbound: None,
            driver,
        });
        Ok(())
    }

    async fn drive_link(self: Arc<Self>, generation: u64, url: String) {
        let link = match self.connector.open(&url).await {
            Ok(link) => link,
            Err(err) => {
                warn!(%url, err = %format!("{err:#}"), "ws: transport failed to open");
                self.handle_error(generation, &err.to_string());
                self.handle_closed(generation, None);
                return;
            }
        };

        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        if !self.handle_open(generation, outbound) {
            return;
        }

        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message(text) => self.handle_message(generation, text),
                TransportEvent::Error(reason) => self.handle_error(generation, &reason),
                TransportEvent::Closed(close) => {
                    self.handle_closed(generation, close);
                    return;
                }
            }
        }
        self.handle_closed(generation, None);
    }

    fn handle_open(
        self: &Arc<Self>,
        generation: u64,
        outbound: tokio::sync::mpsc::UnboundedSender<TransportCommand>,
    ) -> bool {
        let mut state = self.lock();
        let Some(link) = state
            .link
            .as_mut()
            .filter(|link| link.generation == generation)
        else {
            let _ = outbound.send(TransportCommand::Close(NORMAL_CLOSURE));
            return false;
        };
        link.outbound = Some(outbound.clone());
        state.retry_count = 0;

        if let Some(task) = state.heartbeat_task.take() {
            task.abort();
        }
        let period = self.settings.heartbeat_interval();
        state.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if outbound.send(TransportCommand::Ping).is_err() {
                    break;
                }
            }
        }));

        self.status.send_replace(ConnectionStatus::Connected);
        info!(user_id = ?state.session.map(|id| id.0), "ws: transport opened");
        true
    }

    fn handle_message(&self, generation: u64, text: String) {
        if self.lock().generation != generation {
            return;
        }
        let frame = InboundFrame::from_text(text);
        self.subscribers.dispatch(&frame);
    }

    fn handle_error(&self, generation: u64, reason: &str) {
        let state = self.lock();
        if state.generation != generation {
            return;
        }
        warn!(reason, "ws: transport error");
        self.status.send_replace(ConnectionStatus::Error);
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, close: Option<CloseInfo>) {
        let mut state = self.lock();
        if state
            .link
            .as_ref()
            .map_or(true, |link| link.generation != generation)
        {
            return;
        }
        state.link = None;
        if let Some(task) = state.heartbeat_task.take() {
            task.abort();
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
        info!(
            code = close.as_ref().map(|c| c.code),
            reason = close.as_ref().map(|c| c.reason.as_str()),
            "ws: transport closed"
        );

        let Some(user_id) = state.session else {
            return;
        };

        let delay = match self.settings.reconnect.decide(state.retry_count) {
            ReconnectDecision::Retry {
                delay,
                next_retry_count,
            } => {
                state.retry_count = next_retry_count;
                delay
            }
            ReconnectDecision::Cooldown { delay } => {
                warn!(
                    user_id = user_id.0,
                    cooldown_ms = delay.as_millis() as u64,
                    "ws: retry budget exhausted, cooling down"
                );
                state.retry_count = 0;
                delay
            }
            ReconnectDecision::GiveUp => {
                error!(user_id = user_id.0, "ws: retry budget exhausted, giving up");
                state.retry_count = 0;
                self.status.send_replace(ConnectionStatus::Error);
                return;
            }
        };

        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        let generation = state.generation;
        let manager = Arc::clone(self);
        state.reconnect_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            manager.resume(generation, user_id);
        }));
        info!(
            user_id = user_id.0,
            attempt = state.retry_count,
            delay_ms = delay.as_millis() as u64,
            "ws: reconnect scheduled"
        );
    }

    /// Fires a scheduled reconnect unless the manager moved on since it was
    /// scheduled.
    fn resume(self: &Arc<Self>, generation: u64, user_id: UserId) {
        let mut state = self.lock();
        if state.generation != generation || state.link.is_some() {
            debug!(user_id = user_id.0, "ws: stale reconnect skipped");
            return;
        }
        state.reconnect_task = None;
        state.session = Some(user_id);
        let _ = self.open_link(&mut state, user_id);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
