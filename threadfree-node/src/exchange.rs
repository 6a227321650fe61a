//! Confirmable request/response over a secure channel

use std::borrow::Cow;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use threadfree_proto::{Code, FORMAT_JSON, Message, MessageType};

use crate::channel::SecureChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Code,
    pub path: String,
    pub content_format: Option<u16>,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(method: Code, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            content_format: None,
            payload: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Code::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Code::PUT, path)
    }

    /// Attach `body` as an `application/json` payload
    pub fn json<T: Serialize>(mut self, body: &T) -> io::Result<Self> {
        self.payload = serde_json::to_vec(body)?;
        self.content_format = Some(FORMAT_JSON);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub content_format: Option<u16>,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(code: Code, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            content_format: None,
            payload: payload.into(),
        }
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<Message> for Response {
    fn from(message: Message) -> Self {
        Self {
            code: message.code,
            content_format: message.content_format(),
            payload: message.payload,
        }
    }
}

/// Sends one request and waits for its response.
///
/// `Ok(None)` means nothing matching arrived within `timeout`. Transport
/// failures come back as `Err`.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn request(
        &self,
        channel: &mut dyn SecureChannel,
        request: &Request,
        timeout: Duration,
    ) -> io::Result<Option<Response>>;
}

pub struct CoapExchange {
    next_message_id: AtomicU16,
    next_token: AtomicU32,
}

impl CoapExchange {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicU16::new(rand::random()),
            next_token: AtomicU32::new(rand::random()),
        }
    }
}

impl Default for CoapExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for CoapExchange {
    async fn request(
        &self,
        channel: &mut dyn SecureChannel,
        request: &Request,
        timeout: Duration,
    ) -> io::Result<Option<Response>> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let token = self
            .next_token
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();

        let mut message = Message::request(request.method, message_id, token.clone());
        message.set_path(&request.path);
        if let Some(format) = request.content_format {
            message.set_content_format(format);
        }
        message.payload = request.payload.clone();

        tracing::debug!(
            peer = channel.peer(),
            method = %request.method,
            path = %request.path,
            message_id,
            "sending request"
        );
        channel.send(&message.to_bytes()).await?;

        match tokio::time::timeout(timeout, await_reply(channel, message_id, &token)).await {
            Ok(reply) => reply.map(Some),
            Err(_) => {
                tracing::debug!(message_id, ?timeout, "no reply");
                Ok(None)
            }
        }
    }
}

async fn await_reply(
    channel: &mut dyn SecureChannel,
    message_id: u16,
    token: &[u8],
) -> io::Result<Response> {
    loop {
        let datagram = channel.recv().await?;
        let reply = match Message::from_bytes(&datagram) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("dropping undecodable datagram: {e}");
                continue;
            }
        };

        if reply.message_id == message_id {
            match reply.msg_type {
                MessageType::Reset => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("hub reset message {message_id}"),
                    ));
                }
                // Separate response follows in its own message
                MessageType::Acknowledgement if reply.code == Code::EMPTY => continue,
                _ => {}
            }
        }

        if reply.token != token || !reply.code.is_response() {
            tracing::debug!(message_id = reply.message_id, "ignoring unrelated message");
            // Stops the hub retransmitting a late answer to an abandoned request
            if reply.msg_type == MessageType::Confirmable {
                channel
                    .send(&Message::empty_ack(reply.message_id).to_bytes())
                    .await?;
            }
            continue;
        }

        if reply.msg_type == MessageType::Confirmable {
            channel
                .send(&Message::empty_ack(reply.message_id).to_bytes())
                .await?;
        }
        tracing::debug!(code = %reply.code, message_id = reply.message_id, "response");
        return Ok(reply.into());
    }
}
