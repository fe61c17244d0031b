//! # Message Bus and Telemetry Ring
//!
//! Two in-process channels owned by the engine.
//!
//! The [`MessageBus`] is the writers' fan-in: every constructed pooled writer
//! carries a handle to it and publishes a [`WriterEvent`] on commit. Hosts
//! drain the receiving side to drive downstream jobs.
//!
//! The telemetry ring is a bounded queue of [`TelemetryEvent`]s describing
//! table lifecycle operations. Publishing never blocks: when the ring is
//! full the event is dropped, telemetry being strictly best-effort.

use flume::{Receiver, Sender, TrySendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    Committed { table: String, rows: u64 },
}

#[derive(Debug)]
pub struct MessageBus {
    tx: Sender<WriterEvent>,
    rx: Receiver<WriterEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn publish(&self, event: WriterEvent) {
        // The receiver lives as long as the bus, so this cannot fail in
        // practice; a disconnected bus just swallows the event.
        let _ = self.tx.send(event);
    }

    pub fn events(&self) -> &Receiver<WriterEvent> {
        &self.rx
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Created,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub op: TableOp,
    pub table: String,
}

#[derive(Debug)]
pub struct TelemetryRing {
    tx: Sender<TelemetryEvent>,
    rx: Receiver<TelemetryEvent>,
}

impl TelemetryRing {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Best-effort publish; a full ring drops the event.
    pub fn publish(&self, event: TelemetryEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn sender(&self) -> Sender<TelemetryEvent> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> &Receiver<TelemetryEvent> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_delivers_writer_events_in_order() {
        let bus = MessageBus::new();
        bus.publish(WriterEvent::Committed {
            table: "trades".into(),
            rows: 3,
        });
        bus.publish(WriterEvent::Committed {
            table: "quotes".into(),
            rows: 1,
        });

        let first = bus.events().try_recv().unwrap();
        assert_eq!(
            first,
            WriterEvent::Committed {
                table: "trades".into(),
                rows: 3
            }
        );
        assert!(bus.events().try_recv().is_ok());
        assert!(bus.events().try_recv().is_err());
    }

    #[test]
    fn telemetry_ring_drops_when_full() {
        let ring = TelemetryRing::new(1);
        assert!(ring.publish(TelemetryEvent {
            op: TableOp::Created,
            table: "a".into()
        }));
        assert!(!ring.publish(TelemetryEvent {
            op: TableOp::Created,
            table: "b".into()
        }));

        let got = ring.receiver().try_recv().unwrap();
        assert_eq!(got.table, "a");
    }
}
