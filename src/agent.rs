//! Transaction registry.
//!
//! The agent maps in-flight 96-bit transaction IDs to their completion
//! handlers and guarantees exactly one terminal event per registered
//! transaction: a matched response, a timeout, an explicit stop, or a
//! close. Handlers always run outside the registry lock so they are free
//! to call back into the client's send path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::codec::{Message, TransactionId};
use crate::error::Error;

/// Expired-transaction drain buffers are pre-sized to this many entries.
const COLLECT_CAPACITY: usize = 100;

/// The terminal event delivered to a transaction's handler.
pub type Event = Result<Message, Error>;

/// One-shot completion handler for a registered transaction.
pub type Handler = Box<dyn FnOnce(Event) + Send>;

/// Handler for inbound messages that match no registered transaction.
pub type DefaultHandler = Arc<dyn Fn(Event) + Send + Sync>;

struct Transaction {
    deadline: Instant,
    handler: Handler,
}

struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    default_handler: Option<DefaultHandler>,
    closed: bool,
}

/// Thread-safe registry of pending STUN transactions.
pub struct Agent {
    inner: Mutex<Inner>,
}

impl Agent {
    pub fn new() -> Self {
        Agent {
            inner: Mutex::new(Inner {
                transactions: HashMap::new(),
                default_handler: None,
                closed: false,
            }),
        }
    }

    /// Like [`Agent::new`], with a handler that receives inbound messages
    /// matching no registered transaction.
    pub fn with_default_handler(handler: impl Fn(Event) + Send + Sync + 'static) -> Self {
        let agent = Agent::new();
        agent.lock().default_handler = Some(Arc::new(handler));
        agent
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a transaction. Fails with [`Error::AgentClosed`] after
    /// teardown and [`Error::DuplicateTransaction`] on an ID collision.
    pub fn start(
        &self,
        id: TransactionId,
        deadline: Instant,
        handler: Handler,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::AgentClosed);
        }
        if inner.transactions.contains_key(&id) {
            return Err(Error::DuplicateTransaction);
        }
        inner.transactions.insert(id, Transaction { deadline, handler });
        Ok(())
    }

    /// Delivers an inbound message to the matching transaction's handler,
    /// removing it; unmatched messages go to the default handler if one is
    /// configured and are dropped otherwise.
    pub fn process(&self, message: Message) -> Result<(), Error> {
        let (handler, default) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::AgentClosed);
            }
            match inner.transactions.remove(&message.transaction_id) {
                Some(t) => (Some(t.handler), None),
                None => (None, inner.default_handler.clone()),
            }
        };
        if let Some(handler) = handler {
            handler(Ok(message));
        } else if let Some(default) = default {
            default(Ok(message));
        }
        Ok(())
    }

    /// Expires every transaction whose deadline precedes `now`, delivering
    /// [`Error::Timeout`] to each. The expired set is gathered under the
    /// lock and the handlers fire after it is released.
    pub fn collect(&self, now: Instant) -> Result<(), Error> {
        let mut expired: Vec<Handler> = Vec::with_capacity(COLLECT_CAPACITY);
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::AgentClosed);
            }
            let ids: Vec<TransactionId> = inner
                .transactions
                .iter()
                .filter(|(_, t)| t.deadline < now)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(t) = inner.transactions.remove(&id) {
                    expired.push(t.handler);
                }
            }
        }
        for handler in expired {
            handler(Err(Error::Timeout));
        }
        Ok(())
    }

    /// Cancels a transaction, delivering [`Error::StoppedTransaction`].
    pub fn stop(&self, id: TransactionId) -> Result<(), Error> {
        self.stop_with_error(id, Error::StoppedTransaction)
    }

    /// Cancels a transaction, delivering the supplied error instead of the
    /// generic stopped event (used to surface send failures).
    pub fn stop_with_error(&self, id: TransactionId, error: Error) -> Result<(), Error> {
        let transaction = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::AgentClosed);
            }
            inner.transactions.remove(&id)
        };
        match transaction {
            Some(t) => {
                (t.handler)(Err(error));
                Ok(())
            }
            None => Err(Error::UnknownTransaction),
        }
    }

    /// Tears down the registry: every pending handler receives
    /// [`Error::AgentClosed`], the default handler is dropped, and all
    /// further operations fail.
    pub fn close(&self) -> Result<(), Error> {
        let drained: Vec<Handler> = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::AgentClosed);
            }
            inner.closed = true;
            inner.default_handler = None;
            inner
                .transactions
                .drain()
                .map(|(_, t)| t.handler)
                .collect()
        };
        for handler in drained {
            handler(Err(Error::AgentClosed));
        }
        Ok(())
    }
}

impl Default for Agent {
    fn default() -> Self {
        Agent::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, MessageType};
    use std::sync::mpsc;
    use std::time::Duration;

    fn request_with_id(id: TransactionId) -> Message {
        let mut m = Message::new(MessageType::BINDING_REQUEST);
        m.set_transaction_id(id);
        m
    }

    fn capture() -> (Handler, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(move |event| tx.send(event).unwrap()), rx)
    }

    #[test]
    fn process_delivers_matching_message_once() {
        let agent = Agent::new();
        let id = [1u8; 12];
        let (handler, rx) = capture();
        agent.start(id, Instant::now() + Duration::from_secs(1), handler).unwrap();

        agent.process(request_with_id(id)).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.unwrap().transaction_id, id);

        // The transaction is gone: a second matching message is unmatched.
        agent.process(request_with_id(id)).unwrap();
        assert!(rx.try_recv().is_err());
        // And stop now reports it as unknown.
        assert_eq!(agent.stop(id), Err(Error::UnknownTransaction));
    }

    #[test]
    fn unmatched_message_goes_to_default_handler() {
        let (tx, rx) = mpsc::channel();
        let agent = Agent::with_default_handler(move |event| tx.send(event).unwrap());
        agent.process(request_with_id([2u8; 12])).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.unwrap().transaction_id, [2u8; 12]);
    }

    #[test]
    fn unmatched_message_without_default_handler_is_dropped() {
        let agent = Agent::new();
        assert_eq!(agent.process(request_with_id([3u8; 12])), Ok(()));
    }

    #[test]
    fn duplicate_start_rejected_without_firing_either_handler() {
        let agent = Agent::new();
        let id = [4u8; 12];
        let deadline = Instant::now() + Duration::from_secs(1);
        let (first, first_rx) = capture();
        let (second, second_rx) = capture();

        agent.start(id, deadline, first).unwrap();
        assert_eq!(
            agent.start(id, deadline, second),
            Err(Error::DuplicateTransaction)
        );
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_err());

        // The original registration still completes normally.
        agent.process(request_with_id(id)).unwrap();
        assert!(first_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn collect_expires_only_past_deadlines() {
        let agent = Agent::new();
        let now = Instant::now();
        let (expired, expired_rx) = capture();
        let (alive, alive_rx) = capture();
        agent.start([5u8; 12], now + Duration::from_millis(10), expired).unwrap();
        agent.start([6u8; 12], now + Duration::from_secs(60), alive).unwrap();

        agent.collect(now + Duration::from_millis(50)).unwrap();
        assert_eq!(expired_rx.try_recv().unwrap(), Err(Error::Timeout));
        assert!(alive_rx.try_recv().is_err());

        // The expired transaction was removed; the live one still matches.
        agent.process(request_with_id([6u8; 12])).unwrap();
        assert!(alive_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn stop_delivers_stopped_event() {
        let agent = Agent::new();
        let id = [7u8; 12];
        let (handler, rx) = capture();
        agent.start(id, Instant::now() + Duration::from_secs(1), handler).unwrap();
        agent.stop(id).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Err(Error::StoppedTransaction));
    }

    #[test]
    fn stop_with_error_delivers_supplied_error() {
        let agent = Agent::new();
        let id = [8u8; 12];
        let (handler, rx) = capture();
        agent.start(id, Instant::now() + Duration::from_secs(1), handler).unwrap();
        agent
            .stop_with_error(id, Error::Io("host unreachable".into()))
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(Error::Io("host unreachable".into()))
        );
    }

    #[test]
    fn close_drains_pending_and_rejects_everything_after() {
        let agent = Agent::new();
        let (a, a_rx) = capture();
        let (b, b_rx) = capture();
        let deadline = Instant::now() + Duration::from_secs(1);
        agent.start([9u8; 12], deadline, a).unwrap();
        agent.start([10u8; 12], deadline, b).unwrap();

        agent.close().unwrap();
        assert_eq!(a_rx.try_recv().unwrap(), Err(Error::AgentClosed));
        assert_eq!(b_rx.try_recv().unwrap(), Err(Error::AgentClosed));

        let (late, late_rx) = capture();
        assert_eq!(agent.start([11u8; 12], deadline, late), Err(Error::AgentClosed));
        assert!(late_rx.try_recv().is_err());
        assert_eq!(
            agent.process(request_with_id([9u8; 12])),
            Err(Error::AgentClosed)
        );
        assert_eq!(agent.collect(Instant::now()), Err(Error::AgentClosed));
        assert_eq!(agent.stop([9u8; 12]), Err(Error::AgentClosed));
        assert_eq!(agent.close(), Err(Error::AgentClosed));
    }

    #[test]
    fn handler_may_reenter_the_agent() {
        // A handler that starts a new transaction from inside its own
        // completion must not deadlock against the registry lock.
        let agent = Arc::new(Agent::new());
        let id = [12u8; 12];
        let reentrant = Arc::clone(&agent);
        let (tx, rx) = mpsc::channel();
        agent
            .start(
                id,
                Instant::now() + Duration::from_secs(1),
                Box::new(move |_| {
                    let result = reentrant.start(
                        [13u8; 12],
                        Instant::now() + Duration::from_secs(1),
                        Box::new(|_| {}),
                    );
                    tx.send(result).unwrap();
                }),
            )
            .unwrap();

        agent.process(request_with_id(id)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }
}
