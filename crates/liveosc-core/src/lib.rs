//! liveosc - OSC bridge to a live device script.
//!
//! This crate talks to a script running inside a music application over a
//! pair of UDP sockets, using OSC messages. It provides:
//!
//! - **Verbs** - `get`, `set`, `call`, `observe` and `count` against the
//!   device's object model
//! - **Correlation** - routing of out-of-order replies back to their callers
//!   over one shared socket pair
//! - **Notes** - the device's MIDI feed, raw or folded into held notes
//! - **Config** - ports and peer address from a TOML file
//!
//! # Architecture
//!
//! Outbound requests carry a callback id that the device echoes back. The
//! [`Correlator`] owns the table of live ids; a receive thread decodes each
//! inbound datagram, classifies it into an [`InboundMessage`] and hands it
//! to the correlator, the [`NoteHub`] or the service-id feed.
//!
//! ```no_run
//! use liveosc_core::{Bridge, Config, GetArgs};
//! use std::time::Duration;
//!
//! let bridge = Bridge::bind(&Config::default())?;
//! let tempo = bridge
//!     .get(GetArgs::new("live_set", "tempo"))?
//!     .wait_timeout(Duration::from_secs(1))?;
//! println!("tempo: {:?}", tempo);
//! # Ok::<(), liveosc_core::Error>(())
//! ```

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod inbound;
pub mod notes;
pub mod transport;

pub use bridge::{
    Bridge, CallArgs, CountArgs, GetArgs, InboundDispatcher, ObserveArgs, PropertyArgs, SetArgs,
};
pub use config::{Config, PeerSettings, Ports, TimeoutSettings};
pub use correlation::{CallbackId, Correlator, ExchangeKind, PendingReply, Subscription, Verb};
pub use error::{Error, Result};
pub use inbound::{classify, classify_datagram, InboundEnvelope, InboundMessage, ReplyKind};
pub use notes::{ActiveNotes, ActiveNotesSnapshot, NoteEvent, NoteEventStream, NoteHub};
pub use transport::{DatagramSink, ReceiverHandle, UdpTransport};

// Re-exported so callers can build argument values without depending on rosc.
pub use rosc::OscType;

// Returned by the streaming handles' non-blocking receives.
pub use crossbeam_channel::{RecvTimeoutError, TryRecvError};
