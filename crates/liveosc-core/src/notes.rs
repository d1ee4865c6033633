//! Live note state from the device's MIDI feed.
//!
//! The device script forwards every MIDI event it sees as a `/midi` message.
//! [`NoteHub`] fans those events out to per-device listeners, either raw
//! ([`NoteEventStream`]) or folded into the set of currently held notes
//! ([`ActiveNotes`]).
//!
//! The fold is deliberately forgiving: UDP may drop or reorder events, so a
//! note-off for a pitch that was never switched on is a no-op and a repeated
//! note-on simply overwrites the previous entry.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One MIDI event as reported by the device script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoteEvent {
    pub device_id: i32,
    pub pitch: i32,
    /// 0 means note-off.
    pub velocity: i32,
    pub poly_key_pressure_key: i32,
    pub poly_key_pressure_value: i32,
    pub control_change_controller: i32,
    pub control_change_value: i32,
    pub program_change: i32,
    pub after_touch: i32,
    pub pitch_bend: i32,
    pub midi_channel: i32,
}

impl NoteEvent {
    /// Note-on for `pitch` on `device_id`.
    pub fn note_on(device_id: i32, pitch: i32, velocity: i32) -> Self {
        Self {
            device_id,
            pitch,
            velocity,
            ..Self::default()
        }
    }

    /// Note-off (velocity 0) for `pitch` on `device_id`.
    pub fn note_off(device_id: i32, pitch: i32) -> Self {
        Self::note_on(device_id, pitch, 0)
    }

    /// Whether this event holds its pitch down.
    pub fn is_note_on(&self) -> bool {
        self.velocity > 0
    }
}

/// Currently held notes for one device, keyed by pitch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveNotesSnapshot {
    notes: BTreeMap<i32, NoteEvent>,
}

impl ActiveNotesSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the snapshot.
    ///
    /// Returns true if the set of held notes (or the event stored for a
    /// held pitch) changed.
    pub fn apply(&mut self, event: &NoteEvent) -> bool {
        if event.is_note_on() {
            self.notes.insert(event.pitch, *event) != Some(*event)
        } else {
            self.notes.remove(&event.pitch).is_some()
        }
    }

    /// The event that switched `pitch` on, if it is held.
    pub fn get(&self, pitch: i32) -> Option<&NoteEvent> {
        self.notes.get(&pitch)
    }

    pub fn contains(&self, pitch: i32) -> bool {
        self.notes.contains_key(&pitch)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Held pitches in ascending order.
    pub fn pitches(&self) -> impl Iterator<Item = i32> + '_ {
        self.notes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i32, &NoteEvent)> {
        self.notes.iter()
    }
}

struct NoteListener {
    device_id: i32,
    tx: Sender<NoteEvent>,
}

/// Fan-out point for inbound MIDI events.
///
/// Cloning is cheap; all clones share one listener list. Listeners whose
/// receiving end has been dropped are pruned on the next publish for their
/// device.
#[derive(Clone, Default)]
pub struct NoteHub {
    listeners: Arc<Mutex<Vec<NoteListener>>>,
}

impl NoteHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every listener registered for its device.
    pub fn publish(&self, event: NoteEvent) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| {
            listener.device_id != event.device_id || listener.tx.send(event).is_ok()
        });
        log::trace!(
            "[NOTES] dev={} pitch={} vel={} -> {} listeners",
            event.device_id,
            event.pitch,
            event.velocity,
            listeners.len()
        );
    }

    /// Raw, unaggregated events for `device_id`.
    pub fn note_events(&self, device_id: i32) -> NoteEventStream {
        NoteEventStream {
            rx: self.register(device_id),
        }
    }

    /// A fresh held-notes view for `device_id`, starting empty.
    pub fn active_notes(&self, device_id: i32) -> ActiveNotes {
        ActiveNotes {
            rx: self.register(device_id),
            snapshot: ActiveNotesSnapshot::new(),
        }
    }

    /// Number of registered listeners, including ones not yet pruned.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, device_id: i32) -> Receiver<NoteEvent> {
        let (tx, rx) = unbounded();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NoteListener { device_id, tx });
        rx
    }
}

impl std::fmt::Debug for NoteHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Raw note events for one device.
///
/// Iterating blocks until the next event; the iterator ends once the hub
/// that feeds it is gone.
pub struct NoteEventStream {
    rx: Receiver<NoteEvent>,
}

impl NoteEventStream {
    /// Block until the next event.
    pub fn recv(&self) -> Option<NoteEvent> {
        self.rx.recv().ok()
    }

    /// Block for at most `timeout`.
    ///
    /// `Disconnected` means the hub is gone and no event will follow.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<NoteEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<NoteEvent, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Iterator for NoteEventStream {
    type Item = NoteEvent;

    fn next(&mut self) -> Option<NoteEvent> {
        self.recv()
    }
}

/// Held notes for one device, updated as events arrive.
///
/// Each view keeps its own snapshot; dropping it and asking the hub for a
/// new one starts over from an empty set.
pub struct ActiveNotes {
    rx: Receiver<NoteEvent>,
    snapshot: ActiveNotesSnapshot,
}

impl ActiveNotes {
    /// The snapshot as of the last processed event.
    pub fn snapshot(&self) -> &ActiveNotesSnapshot {
        &self.snapshot
    }

    /// Apply every event that has already arrived, without blocking.
    pub fn poll(&mut self) -> &ActiveNotesSnapshot {
        while let Ok(event) = self.rx.try_recv() {
            self.snapshot.apply(&event);
        }
        &self.snapshot
    }

    /// Wait up to `timeout` for one event and apply it.
    ///
    /// Fails with `Timeout` if nothing arrived in time, and with
    /// `Disconnected` once the hub is gone.
    pub fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<&ActiveNotesSnapshot, RecvTimeoutError> {
        let event = self.rx.recv_timeout(timeout)?;
        self.snapshot.apply(&event);
        Ok(&self.snapshot)
    }
}

impl Iterator for ActiveNotes {
    type Item = ActiveNotesSnapshot;

    /// Block for the next event and yield the snapshot after applying it.
    fn next(&mut self) -> Option<ActiveNotesSnapshot> {
        let event = self.rx.recv().ok()?;
        self.snapshot.apply(&event);
        Some(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(500);

    #[test]
    fn test_note_on_then_off_empties_snapshot() {
        let mut snapshot = ActiveNotesSnapshot::new();
        assert!(snapshot.apply(&NoteEvent::note_on(1, 60, 100)));
        assert!(snapshot.contains(60));
        assert_eq!(snapshot.get(60).map(|e| e.velocity), Some(100));

        assert!(snapshot.apply(&NoteEvent::note_off(1, 60)));
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_spurious_note_off_is_noop() {
        let mut snapshot = ActiveNotesSnapshot::new();
        snapshot.apply(&NoteEvent::note_on(1, 64, 90));
        let before = snapshot.clone();

        assert!(!snapshot.apply(&NoteEvent::note_off(1, 60)));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_repeated_note_on_overwrites() {
        let mut snapshot = ActiveNotesSnapshot::new();
        snapshot.apply(&NoteEvent::note_on(1, 60, 100));
        snapshot.apply(&NoteEvent::note_on(1, 60, 40));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(60).map(|e| e.velocity), Some(40));
    }

    #[test]
    fn test_dropped_note_off_keeps_other_pitches() {
        let mut snapshot = ActiveNotesSnapshot::new();
        snapshot.apply(&NoteEvent::note_on(1, 60, 100));
        snapshot.apply(&NoteEvent::note_on(1, 64, 100));
        snapshot.apply(&NoteEvent::note_on(1, 67, 100));
        // note-off for 64 lost in transit
        snapshot.apply(&NoteEvent::note_off(1, 60));
        assert_eq!(snapshot.pitches().collect::<Vec<_>>(), vec![64, 67]);
    }

    #[test]
    fn test_hub_filters_by_device() {
        let hub = NoteHub::new();
        let stream = hub.note_events(2);

        hub.publish(NoteEvent::note_on(1, 60, 100));
        hub.publish(NoteEvent::note_on(2, 62, 80));

        let event = stream.recv_timeout(WAIT).unwrap();
        assert_eq!(event.device_id, 2);
        assert_eq!(event.pitch, 62);
        assert_eq!(stream.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_active_notes_view_folds_events() {
        let hub = NoteHub::new();
        let mut view = hub.active_notes(1);

        hub.publish(NoteEvent::note_on(1, 60, 100));
        let snapshot = view.next().unwrap();
        assert!(snapshot.contains(60));

        hub.publish(NoteEvent::note_off(1, 60));
        let snapshot = view.next().unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_new_view_starts_empty() {
        let hub = NoteHub::new();
        let mut first = hub.active_notes(1);
        hub.publish(NoteEvent::note_on(1, 60, 100));
        assert_eq!(first.poll().len(), 1);

        let mut second = hub.active_notes(1);
        assert!(second.poll().is_empty());
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let hub = NoteHub::new();
        let stream = hub.note_events(1);
        let _other = hub.note_events(2);
        assert_eq!(hub.listener_count(), 2);

        drop(stream);
        hub.publish(NoteEvent::note_on(1, 60, 100));
        assert_eq!(hub.listener_count(), 1);
    }

    #[test]
    fn test_views_report_hub_shutdown() {
        let hub = NoteHub::new();
        let stream = hub.note_events(1);
        let mut view = hub.active_notes(1);

        assert_eq!(stream.recv_timeout(Duration::from_millis(10)), Err(RecvTimeoutError::Timeout));
        assert!(matches!(
            view.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        ));

        hub.publish(NoteEvent::note_on(1, 60, 100));
        drop(hub);

        // events already delivered are still drained first
        assert_eq!(stream.recv_timeout(WAIT).map(|e| e.pitch), Ok(60));
        assert_eq!(stream.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));
        assert!(view.recv_timeout(WAIT).unwrap().contains(60));
        assert!(matches!(view.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected)));
    }
}
