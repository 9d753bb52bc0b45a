//! Scripted transport for driving the connection manager in tests.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

use crate::{
    config::ClientSettings,
    connection::{ConnectionManager, ConnectionStatus},
    transport::{Connector, TransportCommand, TransportEvent, TransportLink},
};

pub const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// The far side of one successfully opened fake transport. Keep it alive for
/// as long as the connection should stay open.
pub struct FakePeer {
    pub url: String,
    pub sent: mpsc::UnboundedReceiver<TransportCommand>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakePeer {
    pub async fn next_command(&mut self) -> TransportCommand {
        time::timeout(WAIT_LIMIT, self.sent.recv())
            .await
            .expect("timed out waiting for an outbound command")
            .expect("transport command channel closed")
    }

    pub async fn next_text(&mut self) -> String {
        loop {
            match self.next_command().await {
                TransportCommand::Text(text) => return text,
                TransportCommand::Ping => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.events
            .send(TransportEvent::Message(text.into()))
            .expect("driver gone");
    }
}

#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub url: String,
    pub at: Instant,
    pub succeeded: bool,
}

pub struct FakeConnector {
    failing: AtomicBool,
    attempts: mpsc::UnboundedSender<ConnectAttempt>,
    peers: mpsc::UnboundedSender<FakePeer>,
}

pub struct FakeHarness {
    pub attempts: mpsc::UnboundedReceiver<ConnectAttempt>,
    pub peers: mpsc::UnboundedReceiver<FakePeer>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, FakeHarness) {
        let (attempts_tx, attempts) = mpsc::unbounded_channel();
        let (peers_tx, peers) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                failing: AtomicBool::new(false),
                attempts: attempts_tx,
                peers: peers_tx,
            }),
            FakeHarness { attempts, peers },
        )
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let succeeded = !self.failing.load(Ordering::SeqCst);
        let _ = self.attempts.send(ConnectAttempt {
            url: url.to_string(),
            at: Instant::now(),
            succeeded,
        });
        if !succeeded {
            return Err(anyhow!("connection refused"));
        }

        let (outbound, sent) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let _ = self.peers.send(FakePeer {
            url: url.to_string(),
            sent,
            events,
        });
        Ok(TransportLink { outbound, inbound })
    }
}

impl FakeHarness {
    pub async fn next_attempt(&mut self) -> ConnectAttempt {
        time::timeout(WAIT_LIMIT, self.attempts.recv())
            .await
            .expect("timed out waiting for a connect attempt")
            .expect("attempt channel closed")
    }

    pub async fn next_peer(&mut self) -> FakePeer {
        time::timeout(WAIT_LIMIT, self.peers.recv())
            .await
            .expect("timed out waiting for a transport")
            .expect("peer channel closed")
    }
}

pub fn test_settings() -> ClientSettings {
    ClientSettings {
        server_url: "http://chat.test".into(),
        heartbeat_interval_secs: 3600,
        ..ClientSettings::default()
    }
}

pub async fn wait_for_status(manager: &ConnectionManager, expected: ConnectionStatus) {
    let mut status = manager.watch_status();
    time::timeout(WAIT_LIMIT, status.wait_for(|current| *current == expected))
        .await
        .expect("timed out waiting for connection status")
        .expect("status channel closed");
}

/// Connects `session` through a fresh fake connector and waits until the
/// transport is open.
pub async fn connected_manager(
    settings: ClientSettings,
    session: &str,
) -> (Arc<ConnectionManager>, Arc<FakeConnector>, FakeHarness, FakePeer) {
    let (connector, mut harness) = FakeConnector::new();
    let manager = ConnectionManager::new(settings, connector.clone());
    manager.connect(session).expect("connect");
    harness.next_attempt().await;
    let peer = harness.next_peer().await;
    wait_for_status(&manager, ConnectionStatus::Connected).await;
    (manager, connector, harness, peer)
}

pub fn assert_delay(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(5),
        "expected a delay of {expected:?}, observed {actual:?}"
    );
}
