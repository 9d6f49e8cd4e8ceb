use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::task::JoinHandle;

use crate::config::RemoteConfig;
use crate::context::RemoteContext;
use crate::message_dispatcher::MessageDispatcher;
use crate::message_registry::MessageRegistry;
use crate::session::{MessageReceiver, RemoteSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login2Gate {
    pub acct: String,
    pub pwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login2GateResult {
    pub is_success: bool,
}

/// One-way chat-style message, for tests without request/response semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub text: String,
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> anyhow::Result<String> {
    if buf.remaining() < 2 {
        anyhow::bail!("missing string length");
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        anyhow::bail!("string is truncated");
    }
    let value = String::from_utf8(buf[..len].to_vec())?;
    buf.advance(len);
    Ok(value)
}

pub fn test_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();

    registry.register::<Login2Gate>(
        101,
        |msg, buf| {
            put_string(buf, &msg.acct);
            put_string(buf, &msg.pwd);
        },
        |mut body| {
            Ok(Login2Gate {
                acct: get_string(&mut body)?,
                pwd: get_string(&mut body)?,
            })
        },
    ).unwrap();

    registry.register::<Login2GateResult>(
        102,
        |msg, buf| buf.put_u8(msg.is_success as u8),
        |body| {
            if body.len() != 1 {
                anyhow::bail!("expected 1 byte, got {}", body.len());
            }
            Ok(Login2GateResult { is_success: body[0] != 0 })
        },
    ).unwrap();

    registry.register::<Note>(
        103,
        |msg, buf| put_string(buf, &msg.text),
        |mut body| Ok(Note { text: get_string(&mut body)? }),
    ).unwrap();

    registry
}

pub fn test_context_with(config: RemoteConfig) -> (Arc<RemoteContext>, Arc<MessageDispatcher>) {
    let dispatcher = Arc::new(MessageDispatcher::new());
    let context = RemoteContext::new(config, test_registry(), dispatcher.handle())
        .expect("test config is valid");
    (context, dispatcher)
}

pub fn test_context() -> (Arc<RemoteContext>, Arc<MessageDispatcher>) {
    test_context_with(RemoteConfig::default())
}

/// Simulates the application context's tick: drains the dispatcher in a loop.
pub fn spawn_drain(dispatcher: Arc<MessageDispatcher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            dispatcher.drain(None).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}

/// Answers every login request with a successful result, swallows everything
///  else.
pub struct EchoReceiver;

#[async_trait]
impl MessageReceiver for EchoReceiver {
    async fn on_message(
        &self,
        _session: &Arc<RemoteSession>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        if message.downcast_ref::<Login2Gate>().is_some() {
            Some(Box::new(Login2GateResult { is_success: true }))
        }
        else {
            None
        }
    }
}

/// Never replies, so rpc requests against it run into their timeout.
pub struct SilentReceiver;

#[async_trait]
impl MessageReceiver for SilentReceiver {
    async fn on_message(
        &self,
        _session: &Arc<RemoteSession>,
        _message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        None
    }
}

/// Records the text of every received [Note], preserving delivery order.
pub struct RecordingReceiver {
    texts: Mutex<Vec<String>>,
}

impl RecordingReceiver {
    pub fn new() -> RecordingReceiver {
        RecordingReceiver {
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        while self.texts.lock().unwrap().len() < count {
            assert!(
                std::time::Instant::now() < deadline,
                "only {} of {} expected messages arrived",
                self.texts.lock().unwrap().len(),
                count,
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageReceiver for RecordingReceiver {
    async fn on_message(
        &self,
        _session: &Arc<RemoteSession>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        if let Some(note) = message.downcast_ref::<Note>() {
            self.texts.lock().unwrap().push(note.text.clone());
        }
        None
    }
}
