//! EMCY: emergency message production and consumption.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;

use canopen_common::messages::{CanId, EmcyMessage, EMCY_BASE};
use canopen_common::node_id::NodeId;
use canopen_common::traits::AsyncCanSender;

use crate::network::{Network, NetworkError};

/// Sends this node's emergency messages at `0x080 + node_id`.
#[derive(Clone)]
pub struct EmcyProducer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    cob_id: CanId,
}

impl<S: AsyncCanSender + 'static> EmcyProducer<S> {
    /// Bind to `node_id`'s EMCY COB-ID
    pub fn new(network: Network<S>, node_id: NodeId) -> Self {
        Self {
            network,
            cob_id: CanId::std(EMCY_BASE + node_id.raw() as u16),
        }
    }

    /// Send an emergency message reporting `error_code` and the current error register
    pub async fn send(&self, error_code: u16, error_register: u8, vendor_data: [u8; 5]) -> Result<(), NetworkError> {
        let msg = EmcyMessage { error_code, error_register, vendor_data };
        let bytes: [u8; 8] = msg.into();
        self.network.send(self.cob_id, &bytes).await
    }

    /// Send the reset-errors message (error code 0x0000), per the object's defined meaning
    pub async fn send_reset(&self, error_register: u8) -> Result<(), NetworkError> {
        self.send(0x0000, error_register, [0; 5]).await
    }
}

/// Invoked for every emergency message received from a monitored node
pub type EmcyCallback = Box<dyn FnMut(u8, EmcyMessage) + Send>;

/// Tracks the most recent emergency condition reported by each monitored node.
#[derive(Clone)]
pub struct EmcyConsumer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    last: Arc<StdMutex<HashMap<u8, EmcyMessage>>>,
    on_emcy: Arc<StdMutex<Option<EmcyCallback>>>,
    notify: Arc<Notify>,
}

impl<S: AsyncCanSender + 'static> EmcyConsumer<S> {
    /// Create a consumer with no monitored nodes yet
    pub fn new(network: Network<S>) -> Self {
        Self {
            network,
            last: Arc::new(StdMutex::new(HashMap::new())),
            on_emcy: Arc::new(StdMutex::new(None)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Register a callback invoked for every emergency message from any watched node
    pub fn set_callback(&self, callback: impl FnMut(u8, EmcyMessage) + Send + 'static) {
        *self.on_emcy.lock().unwrap() = Some(Box::new(callback));
    }

    /// Start monitoring `node`'s EMCY COB-ID
    pub fn watch(&self, node: NodeId) {
        let last = self.last.clone();
        let on_emcy = self.on_emcy.clone();
        let notify = self.notify.clone();
        let node_raw = node.raw();
        self.network.subscribe(CanId::std(EMCY_BASE + node_raw as u16), move |msg| {
            let Ok(emcy) = EmcyMessage::try_from(msg.data()) else { return };
            last.lock().unwrap().insert(node_raw, emcy);
            if let Some(cb) = on_emcy.lock().unwrap().as_mut() {
                cb(node_raw, emcy);
            }
            notify.notify_waiters();
        });
    }

    /// Suspend until the next emergency message from `node` (optionally matching `code`) arrives,
    /// or `timeout` elapses. Returns `None` on timeout.
    pub async fn wait(&self, node: NodeId, code: Option<u16>, timeout: Duration) -> Option<EmcyMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut before = self.last(node);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, self.notify.notified()).await.is_err() {
                return None;
            }
            let after = self.last(node);
            let arrived = match (&before, &after) {
                (None, Some(msg)) => Some(*msg),
                (Some(_), Some(msg)) => Some(*msg),
                _ => None,
            };
            if let Some(msg) = arrived {
                match code {
                    Some(c) if c != msg.error_code => before = after,
                    _ => return Some(msg),
                }
            }
        }
    }

    /// Stop monitoring `node`
    pub fn unwatch(&self, node: NodeId) {
        self.last.lock().unwrap().remove(&node.raw());
        self.network.unsubscribe(CanId::std(EMCY_BASE + node.raw() as u16));
    }

    /// The last emergency message seen from `node`, if any
    pub fn last(&self, node: NodeId) -> Option<EmcyMessage> {
        self.last.lock().unwrap().get(&node.raw()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::messages::CanMessage;
    use canopen_common::traits::AsyncCanReceiver;
    use std::sync::mpsc;

    struct LoopbackSender {
        tx: mpsc::Sender<CanMessage>,
    }

    impl AsyncCanSender for LoopbackSender {
        fn send(&mut self, msg: CanMessage) -> impl std::future::Future<Output = Result<(), CanMessage>> + Send {
            let tx = self.tx.clone();
            async move { tx.send(msg).map_err(|e| e.0) }
        }
    }

    #[derive(Debug)]
    struct NeverError;

    struct NullReceiver;
    impl AsyncCanReceiver for NullReceiver {
        type Error = NeverError;
        fn try_recv(&mut self) -> Option<CanMessage> {
            None
        }
        fn recv(&mut self) -> impl std::future::Future<Output = Result<CanMessage, Self::Error>> + Send {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn producer_sends_at_node_cob_id() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let producer = EmcyProducer::new(network, NodeId::new(9).unwrap());
        producer.send(0x1000, 0x01, [0; 5]).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.id(), CanId::std(EMCY_BASE + 9));
    }

    #[tokio::test]
    async fn consumer_records_last_message() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = EmcyConsumer::new(network.clone());
        let node = NodeId::new(9).unwrap();
        consumer.watch(node);

        let emcy = EmcyMessage { error_code: 0x2310, error_register: 0x04, vendor_data: [1, 2, 3, 4, 5] };
        let bytes: [u8; 8] = emcy.into();
        network.notify(CanMessage::new(CanId::std(EMCY_BASE + 9), &bytes));

        let recorded = consumer.last(node).unwrap();
        assert_eq!(recorded.error_code, 0x2310);
    }

    #[tokio::test]
    async fn wait_returns_once_matching_code_arrives() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = EmcyConsumer::new(network.clone());
        let node = NodeId::new(9).unwrap();
        consumer.watch(node);

        let network2 = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let other = EmcyMessage { error_code: 0x1000, error_register: 0, vendor_data: [0; 5] };
            let bytes: [u8; 8] = other.into();
            network2.notify(CanMessage::new(CanId::std(EMCY_BASE + 9), &bytes));

            tokio::time::sleep(Duration::from_millis(10)).await;
            let target = EmcyMessage { error_code: 0x2310, error_register: 0x04, vendor_data: [1, 2, 3, 4, 5] };
            let bytes: [u8; 8] = target.into();
            network2.notify(CanMessage::new(CanId::std(EMCY_BASE + 9), &bytes));
        });

        let found = consumer.wait(node, Some(0x2310), Duration::from_millis(500)).await.unwrap();
        assert_eq!(found.error_code, 0x2310);
    }

    #[tokio::test]
    async fn wait_times_out_with_no_message() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = EmcyConsumer::new(network);
        let node = NodeId::new(9).unwrap();
        consumer.watch(node);

        let result = consumer.wait(node, None, Duration::from_millis(20)).await;
        assert!(result.is_none());
    }
}
