//! Transport trait and the signal path back to the service.

use crate::domain::error::{LinkError, Result};
use crate::domain::models::{DeviceDescriptor, StatusMessage, TransportKind};
use crate::infrastructure::printer::service::Inbox;
use base64::Engine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One physical connection primitive.
///
/// `open` starts an attempt and returns once it is under way; the outcome is
/// reported through the given [`SignalSender`]. A synchronous error means the
/// attempt never started.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn open(&mut self, target: &DeviceDescriptor, signals: SignalSender) -> Result<()>;

    /// Release the session. Safe to call repeatedly.
    fn close(&mut self);

    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }

    fn write_raw(&mut self, encoded: &str) -> Result<()> {
        let bytes = decode_base64(encoded)?;
        self.write(&bytes)
    }
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| LinkError::InvalidPayload(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    Connected,
    Failed(LinkError),
    Closed(Option<LinkError>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    Link(LinkUpdate),
    Data(Vec<u8>),
    DeviceName(String),
    Notice(StatusMessage),
}

/// Message from a transport, tagged with the attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSignal {
    pub attempt: u64,
    pub kind: TransportKind,
    pub body: SignalBody,
}

/// Handle a transport uses to report progress for one open attempt.
///
/// `connected` and `failed` settle the attempt; only the first of them is
/// delivered, so an attempt cannot report two outcomes.
#[derive(Clone)]
pub struct SignalSender {
    attempt: u64,
    kind: TransportKind,
    settled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Inbox>,
}

impl SignalSender {
    pub(crate) fn new(attempt: u64, kind: TransportKind, tx: mpsc::UnboundedSender<Inbox>) -> Self {
        Self {
            attempt,
            kind,
            settled: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn send(&self, body: SignalBody) -> bool {
        self.tx
            .send(Inbox::Signal(TransportSignal {
                attempt: self.attempt,
                kind: self.kind,
                body,
            }))
            .is_ok()
    }

    /// Returns false if the attempt was already settled.
    pub fn connected(&self) -> bool {
        self.settle() && self.send(SignalBody::Link(LinkUpdate::Connected))
    }

    /// Returns false if the attempt was already settled.
    pub fn failed(&self, error: LinkError) -> bool {
        self.settle() && self.send(SignalBody::Link(LinkUpdate::Failed(error)))
    }

    /// Session ended, before or after it connected.
    pub fn closed(&self, reason: Option<LinkError>) {
        self.settled.store(true, Ordering::SeqCst);
        self.send(SignalBody::Link(LinkUpdate::Closed(reason)));
    }

    pub fn data(&self, bytes: Vec<u8>) {
        self.send(SignalBody::Data(bytes));
    }

    pub fn device_name(&self, name: impl Into<String>) {
        self.send(SignalBody::DeviceName(name.into()));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.send(SignalBody::Notice(StatusMessage::warning(message)));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A signal sender wired to a bare receiver, for driving transports directly.
    pub(crate) fn signal_pair(
        kind: TransportKind,
    ) -> (SignalSender, mpsc::UnboundedReceiver<Inbox>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalSender::new(7, kind, tx), rx)
    }

    pub(crate) fn body(msg: Inbox) -> SignalBody {
        match msg {
            Inbox::Signal(signal) => signal.body,
            other => panic!("expected a transport signal, got {:?}", other),
        }
    }

    #[test]
    fn test_attempt_settles_once() {
        let (signals, mut rx) = signal_pair(TransportKind::Ble);
        assert!(signals.connected());
        assert!(!signals.failed(LinkError::LinkLost("late".into())));
        assert!(!signals.clone().connected());

        assert_eq!(body(rx.try_recv().unwrap()), SignalBody::Link(LinkUpdate::Connected));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_always_delivered() {
        let (signals, mut rx) = signal_pair(TransportKind::Usb);
        signals.closed(None);
        assert!(signals.is_settled());
        assert!(!signals.connected());
        assert_eq!(body(rx.try_recv().unwrap()), SignalBody::Link(LinkUpdate::Closed(None)));
    }

    #[test]
    fn test_decode_base64() {
        assert_eq!(decode_base64("SGVs\nbG8=").unwrap(), b"Hello".to_vec());
        assert!(matches!(
            decode_base64("not base64!"),
            Err(LinkError::InvalidPayload(_))
        ));
    }
}
