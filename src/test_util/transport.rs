use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::{Transport, TransportError};

/// [Transport] test double: records outgoing datagrams for assertions and
/// replays datagrams injected with [RecordingTransport::push_datagram] as
/// inbound traffic.
pub struct RecordingTransport {
    own_id: PeerId,
    sent: RwLock<Vec<String>>,
    fail_sends: AtomicBool,
    inbound_tx: mpsc::Sender<(BytesMut, PeerId)>,
    inbound_rx: Mutex<mpsc::Receiver<(BytesMut, PeerId)>>,
}

impl RecordingTransport {
    pub fn new(own_id: &str) -> RecordingTransport {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        RecordingTransport {
            own_id: PeerId::from(own_id),
            sent: RwLock::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Injects a datagram as if it had arrived from `from`.
    pub async fn push_datagram(&self, payload: &str, from: &str) {
        self.inbound_tx
            .send((BytesMut::from(payload.as_bytes()), PeerId::from(from)))
            .await
            .expect("the transport holds the receiving end itself");
    }

    /// Makes all subsequent sends fail with a network error (they are not
    /// recorded).
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Asserts that the oldest not-yet-asserted datagram equals `expected`,
    /// consuming it.
    pub async fn assert_datagram_sent(&self, expected: &str) {
        let mut sent = self.sent.write().await;
        if sent.is_empty() {
            panic!("no datagram was sent, expected {:?}", expected);
        }
        let actual = sent.remove(0);
        assert_eq!(actual, expected);
    }

    pub async fn assert_no_remaining_datagrams(&self) {
        let sent = self.sent.read().await;
        assert!(sent.is_empty(), "unexpected datagrams sent: {:?}", *sent);
    }

    /// Removes and returns everything sent so far.
    pub async fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.write().await)
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    fn own_id(&self) -> PeerId {
        self.own_id.clone()
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::Network("injected send failure".to_owned()));
        }
        self.sent
            .write()
            .await
            .push(String::from_utf8_lossy(datagram).into_owned());
        Ok(())
    }

    async fn recv(&self) -> Result<(BytesMut, PeerId), TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(datagram) => Ok(datagram),
            None => Err(TransportError::Network("inbound channel closed".to_owned())),
        }
    }
}
