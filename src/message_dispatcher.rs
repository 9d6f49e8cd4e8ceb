use std::any::Any;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::session::RemoteSession;

/// One decoded inbound message, queued for delivery on the application
///  context.
struct InboundMessage {
    session: Arc<RemoteSession>,
    rpc_id: i16,
    message: Box<dyn Any + Send>,
}

/// The single bridge between I/O tasks and the application's execution
///  context. Reader tasks enqueue decoded messages without blocking; the
///  application drains the queue from its own tick, which is where user
///  receivers run.
///
/// Because all sessions share one queue and [MessageDispatcher::drain] is the
///  only consumer, receivers observe messages in enqueue order per session.
pub struct MessageDispatcher {
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MessageDispatcher {
    pub fn new() -> MessageDispatcher {
        let (sender, receiver) = mpsc::unbounded_channel();
        MessageDispatcher {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            sender: self.sender.clone(),
        }
    }

    /// Dequeues up to `max_items` messages (all currently queued when `None`)
    ///  and dispatches each through its session's receiver. Call this from
    ///  the application context's tick.
    ///
    /// For a message carrying a positive rpc id, a non-`None` receiver result
    ///  is sent back as the response with the id negated. Returns the number
    ///  of messages dispatched.
    pub async fn drain(&self, max_items: Option<usize>) -> usize {
        let mut dispatched = 0;

        while max_items.map(|max| dispatched < max).unwrap_or(true) {
            // NB: the lock is released before dispatching - receivers may
            //  themselves trigger enqueues
            let next = self.receiver.lock().unwrap().try_recv();
            match next {
                Ok(item) => {
                    self.dispatch(item).await;
                    dispatched += 1;
                }
                Err(_) => break,
            }
        }
        dispatched
    }

    async fn dispatch(&self, item: InboundMessage) {
        let Some(receiver) = item.session.receiver() else {
            warn!("session {} has no receiver - dropping inbound message", item.session.id());
            return;
        };

        //TODO shield the dispatch loop from panicking receivers
        let reply = receiver.on_message(&item.session, item.message).await;

        if item.rpc_id > 0 {
            match reply {
                Some(reply) => {
                    if let Err(e) = item.session.send_reply(reply, -item.rpc_id) {
                        warn!("session {}: sending rpc response failed: {}", item.session.id(), e);
                    }
                }
                // no reply for a request: the peer eventually observes a timeout
                None => trace!("receiver returned no reply for rpc request {}", item.rpc_id),
            }
        }
        else if reply.is_some() {
            warn!("receiver returned a reply but the peer did not ask for one - dropping it");
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheaply cloneable enqueue side of the dispatcher, shared with every
///  session's receive path.
#[derive(Clone)]
pub struct DispatchHandle {
    sender: mpsc::UnboundedSender<InboundMessage>,
}

impl DispatchHandle {
    pub(crate) fn enqueue(&self, session: Arc<RemoteSession>, rpc_id: i16, message: Box<dyn Any + Send>) {
        let item = InboundMessage { session, rpc_id, message };
        if self.sender.send(item).is_err() {
            warn!("message dispatcher is gone - discarding inbound message");
        }
    }
}
