//! The public face of liveosc.
//!
//! A [`Bridge`] owns one UDP link to the device script and exposes its
//! verbs: `get`, `set`, `call`, `observe` and `count`, plus the MIDI note
//! views and the service-id feed. Everything inbound is handled on the
//! transport's receive thread by an [`InboundDispatcher`].

use crate::config::Config;
use crate::correlation::{Correlator, PendingReply, Subscription, Verb};
use crate::error::{Error, Result};
use crate::inbound::{classify_datagram, InboundMessage};
use crate::notes::{ActiveNotes, NoteEventStream, NoteHub};
use crate::transport::{DatagramSink, ReceiverHandle, UdpTransport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rosc::OscType;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Target of a property verb (`get`, `observe`, `count`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyArgs {
    pub path: String,
    pub property: String,
}

pub type GetArgs = PropertyArgs;
pub type ObserveArgs = PropertyArgs;
pub type CountArgs = PropertyArgs;

impl PropertyArgs {
    pub fn new(path: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            property: property.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        require("path", &self.path)?;
        require("property", &self.property)
    }

    /// The subscription id joins path and property with spaces, so an
    /// observed property must be one word to keep targets apart.
    fn validate_observed(&self) -> Result<()> {
        self.validate()?;
        if self.property.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "observed property {:?} must not contain whitespace",
                self.property
            )));
        }
        Ok(())
    }
}

/// Arguments for `set`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetArgs {
    pub path: String,
    pub property: String,
    pub value: OscType,
}

impl SetArgs {
    pub fn new(path: impl Into<String>, property: impl Into<String>, value: impl Into<OscType>) -> Self {
        Self {
            path: path.into(),
            property: property.into(),
            value: value.into(),
        }
    }
}

/// Arguments for `call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArgs {
    pub path: String,
    pub method: String,
}

impl CallArgs {
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn first_value(values: Vec<OscType>) -> OscType {
    values.into_iter().next().unwrap_or(OscType::Nil)
}

/// Subscribers to service-id announcements.
#[derive(Clone, Default)]
struct Announcements {
    watchers: Arc<Mutex<Vec<Sender<String>>>>,
}

impl Announcements {
    fn watch(&self) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, id: &str) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(id.to_string()).is_ok());
    }
}

/// Handles every datagram coming from the device script.
///
/// Nothing here blocks or fails toward callers: bad datagrams and unknown
/// messages are logged and dropped.
#[derive(Clone)]
pub struct InboundDispatcher {
    correlator: Correlator,
    notes: NoteHub,
    announcements: Announcements,
}

impl InboundDispatcher {
    /// Decode, classify and route one datagram.
    pub fn handle_datagram(&self, bytes: &[u8]) {
        match classify_datagram(bytes) {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(message);
                }
            }
            Err(e) => log::warn!("[BRIDGE] Dropping datagram ({} bytes): {}", bytes.len(), e),
        }
    }

    /// Route one classified message.
    pub fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Reply(envelope) => {
                self.correlator.dispatch(envelope);
            }
            InboundMessage::Ping { payload } => {
                log::trace!("[BRIDGE] ping {:?}", payload);
                if let Err(e) = self.correlator.send_message("/pong", vec![payload]) {
                    log::warn!("[BRIDGE] Failed to answer ping: {}", e);
                }
            }
            InboundMessage::ServiceAnnouncement { id } => {
                log::info!("[BRIDGE] Service id: {}", id);
                self.announcements.publish(&id);
            }
            InboundMessage::Midi(event) => self.notes.publish(event),
            InboundMessage::Unrecognized { addr, args } => {
                log::warn!("[BRIDGE] Unrecognized message {} {:?}", addr, args);
            }
        }
    }
}

/// Connection to one device script.
pub struct Bridge {
    dispatcher: InboundDispatcher,
    local_addr: Option<SocketAddr>,
    receiver: Option<ReceiverHandle>,
}

impl Bridge {
    /// Bind the UDP sockets from `config` and start receiving.
    pub fn bind(config: &Config) -> Result<Self> {
        let transport = UdpTransport::bind(config)?;
        let local_addr = transport.local_receive_addr()?;
        let mut bridge = Self::with_sink(Arc::new(transport.clone()));

        let dispatcher = bridge.dispatcher.clone();
        bridge.receiver =
            Some(transport.spawn_receiver(move |bytes| dispatcher.handle_datagram(bytes))?);
        bridge.local_addr = Some(local_addr);
        Ok(bridge)
    }

    /// A bridge without a receive socket.
    ///
    /// Outbound traffic goes to `sink`; inbound datagrams must be fed in
    /// through [`handle_datagram`](Self::handle_datagram).
    pub fn with_sink(sink: Arc<dyn DatagramSink>) -> Self {
        Self {
            dispatcher: InboundDispatcher {
                correlator: Correlator::new(sink),
                notes: NoteHub::new(),
                announcements: Announcements::default(),
            },
            local_addr: None,
            receiver: None,
        }
    }

    /// Address the receive socket is bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The correlation engine behind the verbs.
    pub fn correlator(&self) -> &Correlator {
        &self.dispatcher.correlator
    }

    /// Feed one inbound datagram.
    pub fn handle_datagram(&self, bytes: &[u8]) {
        self.dispatcher.handle_datagram(bytes);
    }

    /// Read a property. Resolves to the first reply value.
    pub fn get(&self, args: GetArgs) -> Result<PendingReply<OscType>> {
        args.validate()?;
        Ok(self
            .correlator()
            .request(Verb::Get, &args.path, &args.property)?
            .map(first_value))
    }

    /// Write a property. Nothing comes back.
    pub fn set(&self, args: SetArgs) -> Result<()> {
        require("path", &args.path)?;
        require("property", &args.property)?;
        self.correlator().set(&args.path, &args.property, args.value)
    }

    /// Invoke a method. Resolves to every reply value.
    pub fn call(&self, args: CallArgs) -> Result<PendingReply<Vec<OscType>>> {
        require("path", &args.path)?;
        require("method", &args.method)?;
        self.correlator().request(Verb::Call, &args.path, &args.method)
    }

    /// Count the children behind a list property.
    pub fn count(&self, args: CountArgs) -> Result<PendingReply<OscType>> {
        args.validate()?;
        Ok(self
            .correlator()
            .request(Verb::Count, &args.path, &args.property)?
            .map(first_value))
    }

    /// Follow changes to a property.
    pub fn observe(&self, args: ObserveArgs) -> Result<Subscription> {
        args.validate_observed()?;
        self.correlator().observe(&args.path, &args.property)
    }

    /// Drop every pending request and subscription, e.g. after the device
    /// script restarted. Nothing is sent.
    pub fn reset(&self) {
        self.correlator().reset();
    }

    /// Set a status field on the device script.
    pub fn set_field(&self, field: &str, value: impl Into<OscType>) -> Result<()> {
        require("field", field)?;
        self.correlator()
            .send_message("/set_field", vec![OscType::String(field.to_string()), value.into()])
    }

    /// Send an arbitrary message. A leading `/` is added if missing.
    pub fn send_message(&self, address: &str, args: Vec<OscType>) -> Result<()> {
        require("address", address)?;
        if address.starts_with('/') {
            self.correlator().send_message(address, args)
        } else {
            self.correlator().send_message(&format!("/{}", address), args)
        }
    }

    /// Service ids announced by the device script from now on.
    pub fn watch_service_id(&self) -> Receiver<String> {
        self.dispatcher.announcements.watch()
    }

    /// Raw MIDI events for one device.
    pub fn note_events(&self, device_id: i32) -> NoteEventStream {
        self.dispatcher.notes.note_events(device_id)
    }

    /// Held notes for one device, starting from an empty set.
    pub fn active_notes(&self, device_id: i32) -> ActiveNotes {
        self.dispatcher.notes.active_notes(device_id)
    }

    /// Stop the receive thread.
    pub fn shutdown(mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.shutdown();
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("local_addr", &self.local_addr)
            .field("correlator", &self.dispatcher.correlator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::tests::RecordingSink;
    use rosc::{encoder, OscMessage, OscPacket};
    use std::net::UdpSocket;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(500);

    fn setup() -> (Arc<RecordingSink>, Bridge) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sink = Arc::new(RecordingSink::default());
        let bridge = Bridge::with_sink(sink.clone());
        (sink, bridge)
    }

    fn datagram(addr: &str, args: Vec<OscType>) -> Vec<u8> {
        encoder::encode(&OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        }))
        .unwrap()
    }

    fn s(v: &str) -> OscType {
        OscType::String(v.to_string())
    }

    #[test]
    fn test_set_sends_without_tracking() {
        let (sink, bridge) = setup();
        bridge.set(SetArgs::new("/a", "vol", 0.5f32)).unwrap();

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, "/set");
        assert_eq!(sent[0].args, vec![s("/a"), s("vol"), OscType::Float(0.5)]);
        assert_eq!(bridge.correlator().active_count(), 0);
    }

    #[test]
    fn test_get_end_to_end() {
        let (sink, bridge) = setup();
        let pending = bridge.get(GetArgs::new("/a", "vol")).unwrap();
        let id = pending.callback_id().clone();

        let sent = sink.messages();
        assert_eq!(sent[0].addr, "/get");
        assert_eq!(sent[0].args, vec![s("/a"), s("vol"), s(id.as_str())]);

        bridge.handle_datagram(&datagram("/_get_reply", vec![s(id.as_str()), OscType::Float(0.5)]));

        assert_eq!(pending.wait_timeout(WAIT).unwrap(), OscType::Float(0.5));
        assert!(!bridge.correlator().is_active(&id));
    }

    #[test]
    fn test_count_and_call_replies() {
        let (sink, bridge) = setup();
        let count = bridge.count(CountArgs::new("live_set", "tracks")).unwrap();
        let call = bridge.call(CallArgs::new("live_set", "get_notes")).unwrap();

        let sent = sink.messages();
        assert_eq!(sent[0].addr, "/count");
        assert_eq!(sent[1].addr, "/call");

        bridge.handle_datagram(&datagram("/_get_reply", vec![s(count.callback_id().as_str()), OscType::Int(8)]));
        bridge.handle_datagram(&datagram(
            "/_call_reply",
            vec![s(call.callback_id().as_str()), OscType::Int(60), OscType::Int(64)],
        ));

        assert_eq!(count.wait_timeout(WAIT).unwrap(), OscType::Int(8));
        assert_eq!(call.wait_timeout(WAIT).unwrap(), vec![OscType::Int(60), OscType::Int(64)]);
    }

    #[test]
    fn test_empty_get_reply_is_nil() {
        let (_sink, bridge) = setup();
        let pending = bridge.get(GetArgs::new("/a", "vol")).unwrap();
        bridge.handle_datagram(&datagram("/_get_reply", vec![s(pending.callback_id().as_str())]));
        assert_eq!(pending.wait_timeout(WAIT).unwrap(), OscType::Nil);
    }

    #[test]
    fn test_observe_end_to_end() {
        let (sink, bridge) = setup();
        let sub = bridge.observe(ObserveArgs::new("live_set", "tempo")).unwrap();
        let _second = bridge.observe(ObserveArgs::new("live_set", "tempo")).unwrap();
        assert_eq!(sink.count_addr("/observe"), 1);

        let id = sub.callback_id().as_str().to_string();
        bridge.handle_datagram(&datagram("/_observer_reply", vec![s(&id), s("tempo"), OscType::Double(128.0)]));
        assert_eq!(sub.recv_timeout(WAIT), Ok(vec![OscType::Double(128.0)]));
    }

    #[test]
    fn test_observe_rejects_ambiguous_targets() {
        let (sink, bridge) = setup();
        assert!(matches!(
            bridge.observe(ObserveArgs::new("live_set", "tracks 0 mute")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            bridge.observe(ObserveArgs::new("live_set tracks", "0 mute")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(sink.messages().is_empty());

        let _mute = bridge.observe(ObserveArgs::new("live_set tracks 0", "mute")).unwrap();
        let _solo = bridge.observe(ObserveArgs::new("live_set tracks 0", "solo")).unwrap();
        assert_eq!(sink.count_addr("/observe"), 2);
    }

    #[test]
    fn test_get_mapping_is_kept() {
        let (_sink, bridge) = setup();
        let pending = bridge.get(GetArgs::new("live_set", "tempo")).unwrap();
        bridge.handle_datagram(&datagram(
            "/_get_reply",
            vec![s(pending.callback_id().as_str()), OscType::Double(120.0), OscType::Int(9)],
        ));
        assert_eq!(pending.wait_timeout(WAIT).unwrap(), OscType::Double(120.0));

        let raw = bridge.call(CallArgs::new("live_set", "stop_playing")).unwrap();
        let id = raw.callback_id().as_str().to_string();
        let value_count = raw.map(|values| values.len());
        bridge.handle_datagram(&datagram("/_call_reply", vec![s(&id), OscType::Int(1), OscType::Int(2)]));
        assert_eq!(value_count.wait_timeout(WAIT).unwrap(), 2);
    }

    #[test]
    fn test_invalid_args_fail_before_sending() {
        let (sink, bridge) = setup();
        assert!(matches!(bridge.get(GetArgs::new("/a", "")), Err(Error::InvalidArgument(_))));
        assert!(matches!(bridge.call(CallArgs::new("", "fire")), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            bridge.observe(ObserveArgs::new("/a", "  ")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            bridge.set(SetArgs::new("/a", "", 1)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let (sink, bridge) = setup();
        bridge.handle_datagram(&datagram("/ping", vec![OscType::Int(42)]));

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, "/pong");
        assert_eq!(sent[0].args, vec![OscType::Int(42)]);
    }

    #[test]
    fn test_service_id_announcements() {
        let (_sink, bridge) = setup();
        let ids = bridge.watch_service_id();

        bridge.handle_datagram(&datagram("/_service_id", vec![s("device-a")]));
        bridge.handle_datagram(&datagram("/_observer_reply", vec![s("cb"), s("id"), OscType::Int(5)]));

        assert_eq!(ids.recv_timeout(WAIT).unwrap(), "device-a");
        assert_eq!(ids.recv_timeout(WAIT).unwrap(), "5");
    }

    #[test]
    fn test_midi_feeds_note_views() {
        let (_sink, bridge) = setup();
        let mut held = bridge.active_notes(1);
        let raw = bridge.note_events(1);

        bridge.handle_datagram(&datagram("/midi", vec![OscType::Int(1), OscType::Int(60), OscType::Int(100)]));
        assert!(held.poll().contains(60));
        bridge.handle_datagram(&datagram("/midi", vec![OscType::Int(1), OscType::Int(60), OscType::Int(0)]));
        assert!(held.poll().is_empty());

        assert_eq!(raw.recv_timeout(WAIT).map(|e| e.velocity), Ok(100));
        assert_eq!(raw.recv_timeout(WAIT).map(|e| e.velocity), Ok(0));
    }

    #[test]
    fn test_bad_input_is_contained() {
        let (sink, bridge) = setup();
        bridge.handle_datagram(&[0xde, 0xad]);
        bridge.handle_datagram(&datagram("/mystery", vec![]));
        bridge.handle_datagram(&datagram("/_get_reply", vec![s("get#404"), OscType::Int(1)]));
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_set_field_and_raw_messages() {
        let (sink, bridge) = setup();
        bridge.set_field("rs_online", 1).unwrap();
        bridge.send_message("custom", vec![OscType::Int(3)]).unwrap();

        let sent = sink.messages();
        assert_eq!(sent[0].addr, "/set_field");
        assert_eq!(sent[0].args, vec![s("rs_online"), OscType::Int(1)]);
        assert_eq!(sent[1].addr, "/custom");
    }

    #[test]
    fn test_udp_loopback_get() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut config = Config::default();
        config.ports.send = peer.local_addr().unwrap().port();
        config.ports.receive = 0;
        config.peer.bind_host = "127.0.0.1".to_string();

        let bridge = Bridge::bind(&config).unwrap();
        let bridge_addr = bridge.local_addr().unwrap();
        let pending = bridge.get(GetArgs::new("live_set", "tempo")).unwrap();

        let mut buf = [0u8; 1024];
        let (size, _) = peer.recv_from(&mut buf).unwrap();
        let request = match crate::transport::decode_datagram(&buf[..size]).unwrap() {
            OscPacket::Message(msg) => msg,
            OscPacket::Bundle(_) => panic!("unexpected bundle"),
        };
        assert_eq!(request.addr, "/get");

        let reply = datagram("/_get_reply", vec![request.args[2].clone(), OscType::Double(120.0)]);
        peer.send_to(&reply, bridge_addr).unwrap();

        assert_eq!(pending.wait_timeout(Duration::from_secs(2)).unwrap(), OscType::Double(120.0));
        bridge.shutdown();
    }
}
