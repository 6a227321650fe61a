//! In-process stand-ins for the hub side

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use threadfree_proto::{Code, FORMAT_JSON, Message, MessageType};

use crate::channel::{Connector, SecureChannel};
use crate::credential::Credential;
use crate::exchange::{Exchange, Request, Response};
use crate::provision::SecurityKeyPrompt;

type Responder = Box<dyn FnMut(&Message) -> Vec<Vec<u8>> + Send>;

/// Channel whose peer answers each decoded datagram through a closure
pub(crate) struct ScriptedChannel {
    responder: Responder,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    live: Option<Arc<AtomicUsize>>,
}

impl ScriptedChannel {
    pub fn new(responder: impl FnMut(&Message) -> Vec<Vec<u8>> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            inbox: VecDeque::new(),
            sent: Vec::new(),
            live: None,
        }
    }

    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .iter()
            .map(|d| Message::from_bytes(d).unwrap())
            .collect()
    }
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SecureChannel for ScriptedChannel {
    fn peer(&self) -> &str {
        "scripted-hub"
    }

    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.sent.push(datagram.to_vec());
        if let Ok(message) = Message::from_bytes(datagram) {
            let replies = (self.responder)(&message);
            self.inbox.extend(replies);
        }
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        match self.inbox.pop_front() {
            Some(datagram) => Ok(datagram),
            None => std::future::pending().await,
        }
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Responder that piggybacks `code` and a JSON `payload` on the ACK of every
/// confirmable request
pub(crate) fn answer(
    code: Code,
    payload: &'static str,
) -> impl FnMut(&Message) -> Vec<Vec<u8>> + Send + 'static {
    move |request| {
        if request.msg_type != MessageType::Confirmable {
            return Vec::new();
        }
        let mut reply = Message::new(MessageType::Acknowledgement, code, request.message_id);
        reply.token = request.token.clone();
        reply.set_content_format(FORMAT_JSON);
        reply.payload = payload.as_bytes().to_vec();
        vec![reply.to_bytes()]
    }
}

pub(crate) struct Connect {
    pub host: String,
    pub credential: Credential,
    /// Channels from earlier connects still alive at this point
    pub live_before: usize,
}

type ChannelFactory = Box<dyn Fn(&Credential) -> ScriptedChannel + Send + Sync>;

/// Connector handing out scripted channels and recording every handshake
pub(crate) struct RecordingConnector {
    factory: ChannelFactory,
    connects: Mutex<Vec<Connect>>,
    live: Arc<AtomicUsize>,
}

impl RecordingConnector {
    pub fn new(factory: impl Fn(&Credential) -> ScriptedChannel + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            connects: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every channel answers the provisioning POST with `payload`
    pub fn answering(code: Code, payload: &'static str) -> Self {
        Self::new(move |_| ScriptedChannel::new(answer(code, payload)))
    }

    pub fn silent() -> Self {
        Self::new(|_| ScriptedChannel::silent())
    }

    pub fn connects(&self) -> Vec<(String, String, Vec<u8>, usize)> {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                (
                    c.host.clone(),
                    c.credential.identity().to_string(),
                    c.credential.secret().expose().to_vec(),
                    c.live_before,
                )
            })
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, host: &str, credential: &Credential) -> crate::Result<Box<dyn SecureChannel>> {
        let live_before = self.live.fetch_add(1, Ordering::SeqCst);
        self.connects.lock().unwrap().push(Connect {
            host: host.to_string(),
            credential: credential.clone(),
            live_before,
        });
        let mut channel = (self.factory)(credential);
        channel.live = Some(self.live.clone());
        Ok(Box::new(channel))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Reply(Code),
    /// Waits out the timeout it was given, then reports no reply
    Silence,
    /// Never completes
    Hang,
    Fail(io::ErrorKind),
}

/// Exchange that ignores the channel and plays back outcomes in order,
/// repeating `fallback` once the script runs out
pub(crate) struct ScriptedExchange {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    requests: Mutex<Vec<(Request, tokio::time::Instant)>>,
}

impl ScriptedExchange {
    pub fn new(script: Vec<Outcome>, fallback: Outcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(Request, tokio::time::Instant)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn request(
        &self,
        _channel: &mut dyn SecureChannel,
        request: &Request,
        timeout: Duration,
    ) -> io::Result<Option<Response>> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), tokio::time::Instant::now()));
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match outcome {
            Outcome::Reply(code) => Ok(Some(Response::new(code, Vec::new()))),
            Outcome::Silence => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Outcome::Hang => std::future::pending().await,
            Outcome::Fail(kind) => Err(io::Error::new(kind, "scripted failure")),
        }
    }
}

/// Operator who always types the same key
pub(crate) struct FixedPrompt {
    key: Option<String>,
    calls: AtomicUsize,
}

impl FixedPrompt {
    pub fn new(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Behaves like stdin at end of file
    pub fn closed() -> Self {
        Self {
            key: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SecurityKeyPrompt for FixedPrompt {
    fn security_key(&self, _host: &str) -> io::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.key
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no security key entered"))
    }
}
