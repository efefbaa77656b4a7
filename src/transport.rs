//! Duplex WebSocket transport to the agent
//!
//! The socket is split into a write half, owned by a single writer task fed
//! through an unbounded FIFO (so wire order equals `send` order), and a read
//! half, owned by a reader task that parses each frame into a protocol
//! `Message` and hands it to the owner's callback.

use crate::error::{KoraError, Result};
use crate::protocol::{parse_inbound, Message};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Connection state as seen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events produced by the reader task
#[derive(Debug)]
pub enum TransportEvent {
    /// One parsed inbound message
    Message { connection: u64, message: Message },
    /// The connection ended (peer close, network error, or EOF)
    Closed {
        connection: u64,
        reason: Option<String>,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> u64 {
        match self {
            TransportEvent::Message { connection, .. } => *connection,
            TransportEvent::Closed { connection, .. } => *connection,
        }
    }
}

/// Persistent, ordered, bidirectional message channel
pub struct DuplexTransport {
    status: ConnectionStatus,
    connection: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    rx_task: Option<JoinHandle<()>>,
    tx_task: Option<JoinHandle<()>>,
    sent: u64,
    dropped: u64,
}

impl Default for DuplexTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexTransport {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connection: 0,
            outbound: None,
            rx_task: None,
            tx_task: None,
            sent: 0,
            dropped: 0,
        }
    }

    /// Open the connection. Inbound traffic is delivered to `on_event` from
    /// the reader task, tagged with this connection's id.
    pub async fn connect<F>(&mut self, url: &str, timeout: Duration, on_event: F) -> Result<u64>
    where
        F: Fn(TransportEvent) -> bool + Send + 'static,
    {
        if self.status != ConnectionStatus::Disconnected {
            return Ok(self.connection);
        }

        info!("Connecting to agent at {}", url);
        self.status = ConnectionStatus::Connecting;

        let connected = tokio::time::timeout(timeout, connect_async(url)).await;
        let (ws_stream, resp) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("Failed to connect: {}", e);
                self.status = ConnectionStatus::Disconnected;
                return Err(KoraError::WebSocket(e));
            }
            Err(_) => {
                error!("Timeout connecting to {}", url);
                self.status = ConnectionStatus::Disconnected;
                return Err(KoraError::Timeout);
            }
        };
        debug!("WebSocket connection response: {:?}", resp.status());

        self.connection += 1;
        let connection = self.connection;
        let (mut sink, mut stream) = ws_stream.split();

        // ------ Writer: single consumer keeps sends in call order ------
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let tx_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Writer task for connection {} finished", connection);
        });

        // ------ Reader: parse frames in arrival order ------
        let rx_task = tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if !deliver(connection, &text, &on_event) {
                            return;
                        }
                    }
                    Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            if !deliver(connection, text, &on_event) {
                                return;
                            }
                        }
                        Err(_) => warn!("Discarding {} byte binary frame", bytes.len()),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        info!("WebSocket closed by agent: {:?}", frame);
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => {
                        // ping/pong
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            on_event(TransportEvent::Closed { connection, reason });
        });

        self.outbound = Some(out_tx);
        self.rx_task = Some(rx_task);
        self.tx_task = Some(tx_task);
        self.status = ConnectionStatus::Connected;
        info!("Connected to agent (connection {})", connection);
        Ok(connection)
    }

    /// Fire-and-forget send. Dropped when not connected.
    pub fn send(&mut self, msg: &Message) {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_connected()) else {
            self.dropped += 1;
            debug!("Dropping {} send: not connected", msg.type_name());
            return;
        };

        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {}: {}", msg.type_name(), e);
                self.dropped += 1;
                return;
            }
        };

        if outbound.send(WsMessage::Text(json.into())).is_err() {
            self.dropped += 1;
            debug!("Dropping {} send: writer gone", msg.type_name());
            return;
        }
        self.sent += 1;
        match msg {
            Message::AudioInput { content } => debug!("📤 audio_input ({} chars)", content.len()),
            other => info!("📤 {}", other.type_name()),
        }
    }

    /// Record that the reader saw the connection end.
    pub fn mark_closed(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.outbound = None;
        self.rx_task = None;
        self.tx_task = None;
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            // Queued behind any pending sends
            let _ = outbound.send(WsMessage::Close(None));
            info!("Closing connection {}", self.connection);
        }
        if let Some(rx_task) = self.rx_task.take() {
            rx_task.abort();
        }
        self.tx_task = None;
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Id of the current (or last) connection
    pub fn connection_id(&self) -> u64 {
        self.connection
    }

    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        if let Some(rx_task) = self.rx_task.take() {
            rx_task.abort();
        }
    }
}

fn deliver<F>(connection: u64, text: &str, on_event: &F) -> bool
where
    F: Fn(TransportEvent) -> bool,
{
    match parse_inbound(text) {
        Ok(Some(message)) if message.is_client_message() => {
            debug!("Ignoring client-only {} from agent", message.type_name());
            true
        }
        Ok(Some(message)) => {
            match &message {
                Message::Audio { content } => debug!("📥 audio ({} chars)", content.len()),
                other => debug!("📥 {}", other.type_name()),
            }
            on_event(TransportEvent::Message {
                connection,
                message,
            })
        }
        Ok(None) => true,
        Err(e) => {
            warn!("Discarding inbound frame: {}", e);
            debug!("Raw frame: {}", text);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(frame)) = ws.next().await {
                match frame {
                    WsMessage::Text(text) => {
                        received.push(parse_inbound(&text).unwrap().unwrap());
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let mut transport = DuplexTransport::new();
        transport
            .connect(&url, Duration::from_secs(5), |_| true)
            .await
            .unwrap();
        assert!(transport.is_connected());

        for i in 0..5 {
            transport.send(&Message::AudioInput {
                content: format!("chunk{}", i),
            });
        }
        transport.send(&Message::EndOfSpeech {});
        transport.close();
        transport.close();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);

        let received = server.await.unwrap();
        assert_eq!(received.len(), 6);
        for (i, msg) in received.iter().take(5).enumerate() {
            assert_eq!(
                msg,
                &Message::AudioInput {
                    content: format!("chunk{}", i)
                }
            );
        }
        assert_eq!(received[5], Message::EndOfSpeech {});
    }

    #[tokio::test]
    async fn test_inbound_parsing_and_close() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for frame in [
                r#"{"type":"text","content":"one"}"#,
                "garbage",
                r#"{"type":"ping"}"#,
                r#"{"type":"end_of_speech"}"#,
                r#"{"type":"audio","content":"QUJD"}"#,
            ] {
                ws.send(WsMessage::Text(frame.into())).await.unwrap();
            }
            ws.send(WsMessage::Binary(br#"{"type":"end_of_turn"}"#.to_vec().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = DuplexTransport::new();
        let connection = transport
            .connect(&url, Duration::from_secs(5), move |event| tx.send(event).is_ok())
            .await
            .unwrap();

        let mut messages = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.connection(), connection);
            match event {
                TransportEvent::Message { message, .. } => messages.push(message),
                TransportEvent::Closed { .. } => break,
            }
        }

        assert_eq!(
            messages,
            vec![
                Message::Text {
                    content: "one".into()
                },
                Message::Audio {
                    content: "QUJD".into()
                },
                Message::EndOfTurn {},
            ]
        );

        transport.mark_closed();
        transport.send(&Message::EndOfSpeech {});
        assert_eq!(transport.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_dropped() {
        let mut transport = DuplexTransport::new();
        transport.send(&Message::EndOfSpeech {});
        assert_eq!(transport.dropped_count(), 1);
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let (listener, url) = listen().await;
        drop(listener);

        let mut transport = DuplexTransport::new();
        let result = transport.connect(&url, Duration::from_secs(5), |_| true).await;
        assert!(result.is_err());
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }
}
