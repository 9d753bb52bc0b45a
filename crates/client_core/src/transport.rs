use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};

/// Close code sent on an intentional disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Text(String),
    Ping,
    Close(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
    Closed(Option<CloseInfo>),
}

/// An open transport: commands flow out, events flow in. The link is closed
/// once `inbound` yields `Closed` or ends.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<TransportCommand>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut commands) = mpsc::unbounded_channel::<TransportCommand>();
        let (events, inbound) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let closing = matches!(command, TransportCommand::Close(_));
                let message = match command {
                    TransportCommand::Text(text) => Message::Text(text),
                    TransportCommand::Ping => Message::Ping(Vec::new()),
                    TransportCommand::Close(code) => Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    })),
                };
                if let Err(err) = ws_writer.send(message).await {
                    warn!(%err, "ws: send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("ws: writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            warn!("ws: dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let _ = events.send(TransportEvent::Closed(frame.map(|frame| {
                            CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                            }
                        })));
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = events.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(TransportEvent::Closed(None));
        });

        Ok(TransportLink { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
