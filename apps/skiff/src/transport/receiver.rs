use bytes::{Bytes, BytesMut};
use skiff_proto::{ControlFrame, TransferHeader};
use tracing::{debug, warn};

use super::Frame;

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Incoming(TransferHeader),
    /// Fraction of the announced size received so far, in `0.0..=1.0`.
    Progress { name: String, fraction: f64 },
    Complete(Artifact),
}

#[derive(Debug)]
struct TransferState {
    header: TransferHeader,
    received: u64,
    chunks: Vec<Bytes>,
    last_percent: u8,
}

impl TransferState {
    fn new(header: TransferHeader) -> Self {
        Self {
            header,
            received: 0,
            chunks: Vec::new(),
            last_percent: 0,
        }
    }

    fn percent(&self) -> u8 {
        if self.header.size == 0 {
            return 100;
        }
        ((self.received.saturating_mul(100)) / self.header.size).min(100) as u8
    }

    fn progress(&mut self) -> Option<TransferEvent> {
        let percent = self.percent();
        if percent <= self.last_percent {
            return None;
        }
        self.last_percent = percent;
        let fraction = if self.header.size == 0 {
            1.0
        } else {
            self.received as f64 / self.header.size as f64
        };
        Some(TransferEvent::Progress {
            name: self.header.name.clone(),
            fraction,
        })
    }

    fn is_complete(&self) -> bool {
        self.received == self.header.size
    }

    fn into_artifact(self) -> Artifact {
        let mut bytes = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        Artifact {
            name: self.header.name,
            mime: self.header.mime,
            bytes: bytes.freeze(),
        }
    }
}

/// Reassembles one inbound transfer at a time from a peer channel's frames.
#[derive(Debug, Default)]
pub struct TransferReceiver {
    active: Option<TransferState>,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    /// Feed one frame; returns the events it caused, in order.
    pub fn ingest(&mut self, frame: Frame) -> Vec<TransferEvent> {
        match frame {
            Frame::Text(text) => self.on_text(&text),
            Frame::Binary(bytes) => self.on_chunk(bytes),
        }
    }

    fn on_text(&mut self, text: &str) -> Vec<TransferEvent> {
        let header = match ControlFrame::decode(text) {
            Ok(ControlFrame::Header(header)) => header,
            Err(err) => {
                warn!(
                    target = "skiff::transport::receiver",
                    error = %err,
                    "dropping undecodable control frame"
                );
                return Vec::new();
            }
        };

        if let Some(previous) = self.active.take() {
            warn!(
                target = "skiff::transport::receiver",
                name = %previous.header.name,
                received = previous.received,
                size = previous.header.size,
                "new header before transfer completed; discarding partial data"
            );
        }

        debug!(
            target = "skiff::transport::receiver",
            name = %header.name,
            size = header.size,
            mime = %header.mime,
            "incoming transfer"
        );
        let mut events = vec![TransferEvent::Incoming(header.clone())];
        let state = TransferState::new(header);
        if state.is_complete() {
            events.extend(self.finish(state));
        } else {
            self.active = Some(state);
        }
        events
    }

    fn on_chunk(&mut self, mut bytes: Bytes) -> Vec<TransferEvent> {
        let Some(mut state) = self.active.take() else {
            warn!(
                target = "skiff::transport::receiver",
                bytes = bytes.len(),
                "dropping chunk without an active transfer"
            );
            return Vec::new();
        };

        let remaining = state.header.size - state.received;
        if bytes.len() as u64 > remaining {
            warn!(
                target = "skiff::transport::receiver",
                name = %state.header.name,
                excess = bytes.len() as u64 - remaining,
                "chunk overruns announced size; truncating"
            );
            bytes.truncate(remaining as usize);
        }
        state.received += bytes.len() as u64;
        state.chunks.push(bytes);

        if state.is_complete() {
            return self.finish(state);
        }
        let events = state.progress().into_iter().collect();
        self.active = Some(state);
        events
    }

    fn finish(&mut self, mut state: TransferState) -> Vec<TransferEvent> {
        let mut events: Vec<TransferEvent> = state.progress().into_iter().collect();
        debug!(
            target = "skiff::transport::receiver",
            name = %state.header.name,
            bytes = state.received,
            "transfer complete"
        );
        events.push(TransferEvent::Complete(state.into_artifact()));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, size: u64) -> Frame {
        Frame::Text(
            ControlFrame::Header(TransferHeader {
                name: name.into(),
                size,
                mime: "text/plain".into(),
            })
            .encode()
            .unwrap(),
        )
    }

    fn chunk(len: usize) -> Frame {
        Frame::Binary(Bytes::from(vec![7u8; len]))
    }

    fn progress_count(events: &[TransferEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, TransferEvent::Progress { .. }))
            .count()
    }

    #[test]
    fn completes_exactly_at_announced_size() {
        let mut receiver = TransferReceiver::new();
        let events = receiver.ingest(header("a.txt", 10));
        assert!(matches!(&events[..], [TransferEvent::Incoming(h)] if h.size == 10));
        assert!(receiver.is_receiving());

        let events = receiver.ingest(chunk(4));
        assert!(!events.iter().any(|e| matches!(e, TransferEvent::Complete(_))));

        let events = receiver.ingest(chunk(6));
        match events.last() {
            Some(TransferEvent::Complete(artifact)) => {
                assert_eq!(artifact.bytes.len(), 10);
                assert_eq!(artifact.mime, "text/plain");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn progress_is_reported_once_per_percent_and_at_full() {
        let mut receiver = TransferReceiver::new();
        receiver.ingest(header("big.bin", 100_000));
        let mut events = Vec::new();
        // 100-byte chunks advance by a tenth of a percent
        for _ in 0..1000 {
            events.extend(receiver.ingest(chunk(100)));
        }
        assert_eq!(progress_count(&events), 100);
        match events.iter().rev().nth(1) {
            Some(TransferEvent::Progress { fraction, .. }) => assert_eq!(*fraction, 1.0),
            other => panic!("expected final progress, got {other:?}"),
        }
    }

    #[test]
    fn zero_size_header_completes_immediately() {
        let mut receiver = TransferReceiver::new();
        let events = receiver.ingest(header("empty", 0));
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], TransferEvent::Complete(a) if a.bytes.is_empty()));
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn overshoot_is_truncated() {
        let mut receiver = TransferReceiver::new();
        receiver.ingest(header("small", 5));
        let events = receiver.ingest(chunk(8));
        match events.last() {
            Some(TransferEvent::Complete(artifact)) => assert_eq!(artifact.bytes.len(), 5),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn stray_frames_are_dropped() {
        let mut receiver = TransferReceiver::new();
        assert!(receiver.ingest(chunk(16)).is_empty());
        assert!(receiver.ingest(Frame::Text("not json".into())).is_empty());
        assert!(receiver.ingest(Frame::Text(r#"{"type":"trailer"}"#.into())).is_empty());
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn new_header_replaces_partial_transfer() {
        let mut receiver = TransferReceiver::new();
        receiver.ingest(header("first", 10));
        receiver.ingest(chunk(3));
        receiver.ingest(header("second", 2));
        let events = receiver.ingest(chunk(2));
        match events.last() {
            Some(TransferEvent::Complete(artifact)) => {
                assert_eq!(artifact.name, "second");
                assert_eq!(artifact.bytes.len(), 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
