//! Transport halves
//!
//! A session only needs to receive the next inbound unit and send one
//! outbound message. Two transports implement that: WebSocket frames
//! carrying JSON, and newline-delimited plain text over TCP.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::AppError;
use crate::message::{ClientMessage, Message};

/// Line a TCP client sends to ask for the member list
pub const USER_LIST_COMMAND: &str = "/users";

/// One unit read from a transport
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed client message
    Message(ClientMessage),
    /// Something arrived that could not be decoded
    Malformed(String),
    /// The peer closed the connection normally
    Closed,
}

/// Receiving half of a connection
#[async_trait]
pub trait InboundHalf: Send {
    /// Wait for the next inbound unit
    ///
    /// Abnormal transport failures are returned as errors; a normal
    /// close is `Ok(Inbound::Closed)`.
    async fn recv(&mut self) -> Result<Inbound, AppError>;
}

/// Sending half of a connection
#[async_trait]
pub trait OutboundHalf: Send {
    /// Encode and send one message
    async fn send(&mut self, message: &Message) -> Result<(), AppError>;

    /// Close the connection, ignoring errors
    async fn close(&mut self);
}

/// WebSocket receiving half
pub struct WsInbound<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsInbound<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> InboundHalf for WsInbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Inbound, AppError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(Inbound::Closed);
            };

            match frame {
                Ok(WsMessage::Text(text)) => {
                    return Ok(match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(msg) => Inbound::Message(msg),
                        Err(e) => Inbound::Malformed(e.to_string()),
                    });
                }
                Ok(WsMessage::Binary(_)) => {
                    return Ok(Inbound::Malformed(
                        "binary frames are not supported".to_string(),
                    ));
                }
                Ok(WsMessage::Close(_)) => return Ok(Inbound::Closed),
                // Pong is handled automatically by tungstenite
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed)
                | Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                    return Ok(Inbound::Closed);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// WebSocket sending half, one JSON text frame per message
pub struct WsOutbound<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> WsOutbound<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> OutboundHalf for WsOutbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &Message) -> Result<(), AppError> {
        let json = serde_json::to_string(message)?;
        self.sink.send(WsMessage::Text(json.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// Line-based receiving half
///
/// Every line is a chat message, except `/users` which asks for the
/// member list.
pub struct LineInbound<R> {
    lines: Lines<BufReader<R>>,
}

impl<R> LineInbound<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::from_lines(BufReader::new(reader).lines())
    }

    /// Continue from a reader whose first lines were already consumed
    pub fn from_lines(lines: Lines<BufReader<R>>) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl<R> InboundHalf for LineInbound<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Inbound, AppError> {
        let Some(line) = self.lines.next_line().await? else {
            return Ok(Inbound::Closed);
        };

        let line = line.trim_end_matches('\r');
        if line.trim() == USER_LIST_COMMAND {
            return Ok(Inbound::Message(ClientMessage::UserList));
        }
        Ok(Inbound::Message(ClientMessage::Chat {
            content: line.to_string(),
            send_time: None,
        }))
    }
}

/// Line-based sending half, one rendered line per message
pub struct LineOutbound<W> {
    writer: W,
}

impl<W> LineOutbound<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a raw line, used before a session exists
    pub async fn write_line(&mut self, line: &str) -> Result<(), AppError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> OutboundHalf for LineOutbound<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &Message) -> Result<(), AppError> {
        self.write_line(&message.render_line()).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Line transport shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn test_line_inbound() {
        let (mut client, server) = duplex(256);
        let mut inbound = LineInbound::new(server);

        client.write_all(b"hello\r\n/users\n").await.unwrap();
        drop(client);

        match inbound.recv().await.unwrap() {
            Inbound::Message(ClientMessage::Chat { content, send_time }) => {
                assert_eq!(content, "hello");
                assert!(send_time.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            inbound.recv().await.unwrap(),
            Inbound::Message(ClientMessage::UserList)
        ));
        assert!(matches!(inbound.recv().await.unwrap(), Inbound::Closed));
    }

    #[tokio::test]
    async fn test_line_outbound() {
        let (mut client, server) = duplex(256);
        let mut outbound = LineOutbound::new(server);

        outbound.send(&Message::error("nope")).await.unwrap();
        outbound.close().await;

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "! nope\n");
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let (client, server) = duplex(4096);

        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server).await.unwrap();
            let (sink, stream) = ws.split();
            let mut inbound = WsInbound::new(stream);
            let mut outbound = WsOutbound::new(sink);

            let first = inbound.recv().await.unwrap();
            let second = inbound.recv().await.unwrap();
            outbound.send(&Message::error("bye")).await.unwrap();
            outbound.close().await;
            (first, second)
        });

        let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/ws", client)
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"type":"chat","content":"hi"}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text("not json".into())).await.unwrap();

        let reply = ws.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["content"], "bye");

        let (first, second) = server.await.unwrap();
        assert!(matches!(
            first,
            Inbound::Message(ClientMessage::Chat { ref content, .. }) if content == "hi"
        ));
        assert!(matches!(second, Inbound::Malformed(_)));
    }
}
