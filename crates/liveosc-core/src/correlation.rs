//! Request/reply correlation over the shared UDP link.
//!
//! All verbs and all callers share one socket pair, and the device script
//! answers out of order. Each outbound request therefore carries a callback
//! id which the reply echoes back; the [`Correlator`] keeps the table of
//! live ids and routes every reply to whoever is waiting on it.
//!
//! Two lifecycles exist:
//!
//! - **One-shot** (`get`, `call`, `count`): a fresh id per request. The first
//!   matching reply resolves the [`PendingReply`] and the id is released.
//! - **Subscription** (`observe`): the id is derived from the target, so
//!   observing the same property twice shares one wire subscription. Each
//!   [`Subscription`] handle is one listener; the id is released when the
//!   last listener is dropped.
//!
//! The protocol has no unsubscribe message. Releasing a subscription only
//! stops local delivery; the device may keep sending replies, which are then
//! dropped as unmatched.

use crate::error::{Error, Result};
use crate::inbound::{InboundEnvelope, ReplyKind};
use crate::transport::{encode_message, DatagramSink};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rosc::OscType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Correlation token echoed back by the device script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(String);

impl CallbackId {
    /// Deterministic id for observing `property` on `path`.
    ///
    /// Paths contain spaces, so the id is only unambiguous while `property`
    /// is a single word; [`Correlator::observe`] enforces that.
    pub fn for_subscription(path: &str, property: &str) -> Self {
        Self(format!("{} {} {}", Verb::Observe.name(), path, property))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallbackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CallbackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request kinds understood by the device script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Set,
    Call,
    Observe,
    Count,
}

impl Verb {
    pub fn name(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Set => "set",
            Verb::Call => "call",
            Verb::Observe => "observe",
            Verb::Count => "count",
        }
    }

    /// OSC address the request is sent to.
    pub fn address(self) -> &'static str {
        match self {
            Verb::Get => "/get",
            Verb::Set => "/set",
            Verb::Call => "/call",
            Verb::Observe => "/observe",
            Verb::Count => "/count",
        }
    }

    /// Reply kind that answers this verb, if any.
    pub fn reply_kind(self) -> Option<ReplyKind> {
        match self {
            Verb::Get | Verb::Count => Some(ReplyKind::Get),
            Verb::Call => Some(ReplyKind::Call),
            Verb::Observe => Some(ReplyKind::Observer),
            Verb::Set => None,
        }
    }
}

/// Lifecycle of a live exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    OneShot,
    Subscription,
}

type ReplyResult = Result<Vec<OscType>>;

enum Exchange {
    OneShot {
        expects: ReplyKind,
        tx: Sender<ReplyResult>,
    },
    Subscription {
        listeners: Vec<(u64, Sender<Vec<OscType>>)>,
    },
}

impl Exchange {
    fn kind(&self) -> ExchangeKind {
        match self {
            Exchange::OneShot { .. } => ExchangeKind::OneShot,
            Exchange::Subscription { .. } => ExchangeKind::Subscription,
        }
    }
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<CallbackId, Exchange>,
    next_callback: u64,
    next_listener: u64,
}

impl Registry {
    fn fresh_callback(&mut self, verb: Verb) -> CallbackId {
        self.next_callback += 1;
        CallbackId(format!("{}#{}", verb.name(), self.next_callback))
    }

    fn fresh_listener(&mut self) -> u64 {
        self.next_listener += 1;
        self.next_listener
    }

    fn cancel(&mut self, id: &CallbackId) {
        if matches!(self.exchanges.get(id), Some(Exchange::OneShot { .. })) {
            self.exchanges.remove(id);
            log::trace!("[BRIDGE] Released {}", id);
        }
    }

    fn detach(&mut self, id: &CallbackId, listener: u64) {
        let now_empty = match self.exchanges.get_mut(id) {
            Some(Exchange::Subscription { listeners }) => {
                listeners.retain(|(l, _)| *l != listener);
                listeners.is_empty()
            }
            _ => false,
        };
        if now_empty {
            self.exchanges.remove(id);
            log::debug!("[BRIDGE] Last listener left, released {}", id);
        }
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes replies from the device script back to their requesters.
///
/// Cloning is cheap; clones share the same exchange table. Each peer
/// connection should have its own correlator.
#[derive(Clone)]
pub struct Correlator {
    sink: Arc<dyn DatagramSink>,
    registry: SharedRegistry,
}

impl Correlator {
    pub fn new(sink: Arc<dyn DatagramSink>) -> Self {
        Self {
            sink,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Encode and send one message; no reply is tracked.
    pub fn send_message(&self, addr: &str, args: Vec<OscType>) -> Result<()> {
        log::debug!("[OSC] {} {:?}", addr, args);
        let bytes = encode_message(addr, args)?;
        self.sink.send_datagram(&bytes)
    }

    /// Fire-and-forget property write.
    pub fn set(&self, path: &str, property: &str, value: OscType) -> Result<()> {
        self.send_message(
            Verb::Set.address(),
            vec![
                OscType::String(path.to_string()),
                OscType::String(property.to_string()),
                value,
            ],
        )
    }

    /// Send a one-shot request and return a handle for its reply values.
    ///
    /// `verb` must be `Get`, `Call` or `Count`.
    pub fn request(&self, verb: Verb, path: &str, secondary: &str) -> Result<PendingReply<Vec<OscType>>> {
        let expects = match verb {
            Verb::Get | Verb::Call | Verb::Count => verb.reply_kind(),
            Verb::Set | Verb::Observe => None,
        }
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a one-shot verb", verb.name()))
        })?;

        let (tx, rx) = bounded(1);
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.fresh_callback(verb);
            registry
                .exchanges
                .insert(id.clone(), Exchange::OneShot { expects, tx });
            id
        };

        let args = vec![
            OscType::String(path.to_string()),
            OscType::String(secondary.to_string()),
            OscType::String(id.0.clone()),
        ];
        if let Err(e) = self.send_message(verb.address(), args) {
            lock(&self.registry).cancel(&id);
            return Err(e);
        }

        Ok(PendingReply {
            id,
            rx,
            registry: Arc::clone(&self.registry),
            map: |values| values,
            settled: false,
        })
    }

    /// Observe `property` on `path`.
    ///
    /// Only the first listener for a target sends `/observe`; later ones
    /// attach to the existing subscription. The check and the send happen
    /// under one lock so concurrent callers cannot both subscribe.
    pub fn observe(&self, path: &str, property: &str) -> Result<Subscription> {
        if property.is_empty() || property.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "observed property {:?} must be a single word",
                property
            )));
        }
        let id = CallbackId::for_subscription(path, property);
        let (tx, rx) = unbounded();

        let mut registry = lock(&self.registry);
        let listener = registry.fresh_listener();

        match registry.exchanges.get_mut(&id) {
            Some(Exchange::Subscription { listeners }) => {
                listeners.push((listener, tx));
                log::debug!("[BRIDGE] {} now has {} listeners", id, listeners.len());
            }
            Some(Exchange::OneShot { .. }) => {
                return Err(Error::InvalidArgument(format!(
                    "callback id {} is held by a one-shot request",
                    id
                )));
            }
            None => {
                let args = vec![
                    OscType::String(path.to_string()),
                    OscType::String(property.to_string()),
                    OscType::String(id.0.clone()),
                ];
                self.send_message(Verb::Observe.address(), args)?;
                registry.exchanges.insert(
                    id.clone(),
                    Exchange::Subscription {
                        listeners: vec![(listener, tx)],
                    },
                );
                log::debug!("[BRIDGE] Subscribed {}", id);
            }
        }
        drop(registry);

        Ok(Subscription {
            id,
            listener,
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Route a classified reply.
    ///
    /// Returns true if it reached at least one waiter. Unknown ids and
    /// replies of the wrong kind are dropped; stale replies are normal.
    pub fn dispatch(&self, envelope: InboundEnvelope) -> bool {
        let InboundEnvelope {
            callback_id,
            kind,
            values,
        } = envelope;
        let mut registry = lock(&self.registry);

        let matches = match registry.exchanges.get(&callback_id) {
            None => {
                log::trace!("[BRIDGE] Dropping reply for unknown {}", callback_id);
                return false;
            }
            Some(Exchange::OneShot { expects, .. }) => *expects == kind,
            Some(Exchange::Subscription { .. }) => kind == ReplyKind::Observer,
        };
        if !matches {
            log::debug!(
                "[BRIDGE] Ignoring {:?} reply for {} of another kind",
                kind,
                callback_id
            );
            return false;
        }

        if kind == ReplyKind::Observer {
            if let Some(Exchange::Subscription { listeners }) = registry.exchanges.get(&callback_id) {
                for (_, tx) in listeners {
                    let _ = tx.send(values.clone());
                }
            }
        } else if let Some(Exchange::OneShot { tx, .. }) = registry.exchanges.remove(&callback_id) {
            let _ = tx.send(Ok(values));
            log::trace!("[BRIDGE] Resolved {}", callback_id);
        }
        true
    }

    /// Forget every live exchange without telling the peer.
    ///
    /// Waiting one-shot handles fail with [`Error::Disconnected`], existing
    /// subscriptions stop receiving, and the next `observe` of any target
    /// subscribes afresh.
    pub fn reset(&self) {
        let drained: Vec<_> = lock(&self.registry).exchanges.drain().collect();
        log::info!("[BRIDGE] Reset, dropped {} exchanges", drained.len());
        for (_, exchange) in drained {
            if let Exchange::OneShot { tx, .. } = exchange {
                let _ = tx.send(Err(Error::Disconnected));
            }
        }
    }

    /// Whether `id` has a live exchange.
    pub fn is_active(&self, id: &CallbackId) -> bool {
        lock(&self.registry).exchanges.contains_key(id)
    }

    /// Kind of the live exchange for `id`.
    pub fn exchange_kind(&self, id: &CallbackId) -> Option<ExchangeKind> {
        lock(&self.registry).exchanges.get(id).map(Exchange::kind)
    }

    /// Number of live exchanges.
    pub fn active_count(&self) -> usize {
        lock(&self.registry).exchanges.len()
    }

    /// Snapshot of the live callback ids.
    pub fn active_callbacks(&self) -> Vec<CallbackId> {
        let mut ids: Vec<_> = lock(&self.registry).exchanges.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of listeners attached to the subscription `id`.
    pub fn listener_count(&self, id: &CallbackId) -> usize {
        match lock(&self.registry).exchanges.get(id) {
            Some(Exchange::Subscription { listeners }) => listeners.len(),
            _ => 0,
        }
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// Handle for the single reply to a one-shot request.
///
/// Dropping it before the reply arrives releases the callback id; a late
/// reply is then dropped as unmatched.
pub struct PendingReply<T> {
    id: CallbackId,
    rx: Receiver<ReplyResult>,
    registry: SharedRegistry,
    map: fn(Vec<OscType>) -> T,
    settled: bool,
}

impl PendingReply<Vec<OscType>> {
    /// Transform the raw reply values.
    ///
    /// Only raw replies can be mapped, so an earlier mapping is never lost.
    pub fn map<U>(mut self, map: fn(Vec<OscType>) -> U) -> PendingReply<U> {
        self.settled = true;
        PendingReply {
            id: self.id.clone(),
            rx: self.rx.clone(),
            registry: Arc::clone(&self.registry),
            map,
            settled: false,
        }
    }
}

impl<T> PendingReply<T> {
    /// Callback id carried by the request.
    pub fn callback_id(&self) -> &CallbackId {
        &self.id
    }

    /// Block until the reply arrives.
    ///
    /// Waits forever if the device never answers; prefer
    /// [`wait_timeout`](Self::wait_timeout).
    pub fn wait(mut self) -> Result<T> {
        let outcome = self.rx.recv().unwrap_or(Err(Error::Disconnected));
        self.settle(outcome)
    }

    /// Block for at most `timeout`. On expiry the request is cancelled.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => self.settle(outcome),
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("[BRIDGE] {} timed out after {:?}", self.id, timeout);
                Err(Error::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => self.settle(Err(Error::Disconnected)),
        }
    }

    /// Take the reply if it has already arrived.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(self.settle(outcome)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.settle(Err(Error::Disconnected))),
        }
    }

    fn settle(&mut self, outcome: ReplyResult) -> Result<T> {
        self.settled = true;
        outcome.map(self.map)
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.registry).cancel(&self.id);
        }
    }
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

/// One listener on an observed property.
///
/// Each received item is the value list of one observer reply. Dropping the
/// handle detaches the listener immediately.
pub struct Subscription {
    id: CallbackId,
    listener: u64,
    rx: Receiver<Vec<OscType>>,
    registry: SharedRegistry,
}

impl Subscription {
    pub fn callback_id(&self) -> &CallbackId {
        &self.id
    }

    /// Block until the next update. `None` once the exchange was reset.
    pub fn recv(&self) -> Option<Vec<OscType>> {
        self.rx.recv().ok()
    }

    /// Block for at most `timeout`.
    ///
    /// `Disconnected` means the exchange was reset and no update will follow.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Vec<OscType>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> std::result::Result<Vec<OscType>, TryRecvError> {
        self.rx.try_recv()
    }

    /// Detach this listener.
    pub fn dispose(self) {}
}

impl Iterator for Subscription {
    type Item = Vec<OscType>;

    fn next(&mut self) -> Option<Vec<OscType>> {
        self.recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.registry).detach(&self.id, self.listener);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("listener", &self.listener)
            .finish()
    }
}
