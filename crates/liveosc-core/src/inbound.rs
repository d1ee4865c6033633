//! Classification of messages arriving from the device script.
//!
//! Every decoded OSC message maps to exactly one [`InboundMessage`] variant.
//! Nothing here fails: messages that do not fit a known shape become
//! [`InboundMessage::Unrecognized`] and are logged by the dispatcher.

use crate::correlation::CallbackId;
use crate::error::Result;
use crate::notes::NoteEvent;
use crate::transport::decode_datagram;
use rosc::{OscMessage, OscPacket, OscType};

pub const GET_REPLY: &str = "/_get_reply";
pub const OBSERVER_REPLY: &str = "/_observer_reply";
pub const CALL_REPLY: &str = "/_call_reply";
pub const PING: &str = "/ping";
pub const SERVICE_ID: &str = "/_service_id";
pub const MIDI: &str = "/midi";

/// Observer replies carrying this tag in their second slot announce an
/// object identity rather than a property value.
const IDENTITY_TAG: &str = "id";

/// Which verb a reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Answer to `get` or `count`.
    Get,
    /// Value change pushed for an `observe`.
    Observer,
    /// Answer to `call`.
    Call,
}

/// A reply ready to be routed by callback id.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub callback_id: CallbackId,
    pub kind: ReplyKind,
    pub values: Vec<OscType>,
}

/// One classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply for the correlation engine.
    Reply(InboundEnvelope),
    /// Service identity announcement.
    ServiceAnnouncement { id: String },
    /// Liveness check; must be answered with `/pong`.
    Ping { payload: OscType },
    /// MIDI event for the note hub.
    Midi(NoteEvent),
    /// Anything else.
    Unrecognized { addr: String, args: Vec<OscType> },
}

/// Decode a datagram and classify every message in it.
///
/// Bundles are flattened in order.
pub fn classify_datagram(bytes: &[u8]) -> Result<Vec<InboundMessage>> {
    let packet = decode_datagram(bytes)?;
    let mut out = Vec::new();
    flatten(packet, &mut out);
    Ok(out)
}

fn flatten(packet: OscPacket, out: &mut Vec<InboundMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(classify(msg)),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out);
            }
        }
    }
}

/// Classify one decoded message.
pub fn classify(msg: OscMessage) -> InboundMessage {
    let OscMessage { addr, mut args } = msg;

    match addr.as_str() {
        GET_REPLY => reply(addr, args, ReplyKind::Get, 1),
        CALL_REPLY => reply(addr, args, ReplyKind::Call, 1),
        OBSERVER_REPLY => {
            if matches!(args.get(1), Some(OscType::String(tag)) if tag == IDENTITY_TAG) {
                return match args.get(2).and_then(osc_to_string) {
                    Some(id) => InboundMessage::ServiceAnnouncement { id },
                    None => InboundMessage::Unrecognized { addr, args },
                };
            }
            reply(addr, args, ReplyKind::Observer, 2)
        }
        PING => {
            if args.is_empty() {
                return InboundMessage::Unrecognized { addr, args };
            }
            InboundMessage::Ping {
                payload: args.swap_remove(0),
            }
        }
        SERVICE_ID => match args.first().and_then(osc_to_string) {
            Some(id) => InboundMessage::ServiceAnnouncement { id },
            None => InboundMessage::Unrecognized { addr, args },
        },
        MIDI => match parse_note_event(&args) {
            Some(event) => InboundMessage::Midi(event),
            None => InboundMessage::Unrecognized { addr, args },
        },
        _ => InboundMessage::Unrecognized { addr, args },
    }
}

/// Build a reply envelope: `args[0]` is the callback id, values start at
/// `values_from`.
fn reply(addr: String, args: Vec<OscType>, kind: ReplyKind, values_from: usize) -> InboundMessage {
    let callback_id = match args.first().and_then(osc_to_string) {
        Some(id) => CallbackId::from(id),
        None => return InboundMessage::Unrecognized { addr, args },
    };
    let values = args.into_iter().skip(values_from).collect();
    InboundMessage::Reply(InboundEnvelope {
        callback_id,
        kind,
        values,
    })
}

/// Parse `/midi` args by position.
///
/// Layout: device_id, pitch, velocity, poly_key_pressure_key,
/// poly_key_pressure_value, cc_controller, cc_value, program_change,
/// after_touch, pitch_bend, midi_channel. The first three are required;
/// missing trailing fields read as 0.
pub fn parse_note_event(args: &[OscType]) -> Option<NoteEvent> {
    let field = |i: usize| args.get(i).and_then(osc_to_i32);
    let optional = |i: usize| field(i).unwrap_or(0);

    Some(NoteEvent {
        device_id: field(0)?,
        pitch: field(1)?,
        velocity: field(2)?,
        poly_key_pressure_key: optional(3),
        poly_key_pressure_value: optional(4),
        control_change_controller: optional(5),
        control_change_value: optional(6),
        program_change: optional(7),
        after_touch: optional(8),
        pitch_bend: optional(9),
        midi_channel: optional(10),
    })
}

fn osc_to_i32(value: &OscType) -> Option<i32> {
    match value {
        OscType::Int(n) => Some(*n),
        OscType::Long(n) => i32::try_from(*n).ok(),
        OscType::Float(f) => Some(*f as i32),
        OscType::Double(d) => Some(*d as i32),
        _ => None,
    }
}

/// Callback ids and service ids are strings on our side, but the device
/// runtime may hand numeric-looking symbols back as numbers.
fn osc_to_string(value: &OscType) -> Option<String> {
    match value {
        OscType::String(s) => Some(s.clone()),
        OscType::Int(n) => Some(n.to_string()),
        OscType::Long(n) => Some(n.to_string()),
        OscType::Float(f) => Some(f.to_string()),
        OscType::Double(d) => Some(d.to_string()),
        _ => None,
    }
}
