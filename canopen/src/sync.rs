//! SYNC: the synchronization producer and consumer.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use canopen_common::messages::{CanMessage, SyncObject, SYNC_ID};
use canopen_common::traits::AsyncCanSender;

use crate::network::Network;

/// Produces SYNC messages at a configured period (OD 0x1005/0x1006), optionally with a wrapping
/// counter byte (OD 0x1019's overflow value; 0 means no counter is sent).
pub struct SyncProducer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    overflow: StdMutex<u8>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: AsyncCanSender + 'static> SyncProducer<S> {
    /// Create a producer. `overflow` is the counter wrap value from OD 0x1019; 0 disables the
    /// counter byte entirely.
    pub fn new(network: Network<S>, overflow: u8) -> Self {
        Self {
            network,
            overflow: StdMutex::new(overflow),
            handle: StdMutex::new(None),
        }
    }

    /// Change the counter overflow value. Takes effect on the next `start()`.
    pub fn set_overflow(&self, overflow: u8) {
        *self.overflow.lock().unwrap() = overflow;
    }

    fn frame(counter: Option<u8>) -> Vec<u8> {
        let msg: CanMessage = SyncObject { counter }.into();
        msg.data().to_vec()
    }

    /// Start sending SYNC at `period`. Replaces any previously running producer.
    pub fn start(&self, period: Duration) {
        self.stop();
        let network = self.network.clone();
        let overflow = *self.overflow.lock().unwrap();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut counter: u8 = 1;
            loop {
                ticker.tick().await;
                let payload = if overflow == 0 {
                    Self::frame(None)
                } else {
                    let this = counter;
                    counter = if counter >= overflow { 1 } else { counter + 1 };
                    Self::frame(Some(this))
                };
                if let Err(e) = network.send(SYNC_ID, &payload).await {
                    log::warn!("SYNC send failed: {e}");
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop sending SYNC.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl<S: AsyncCanSender + 'static> Drop for SyncProducer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::messages::CanId;
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
    async fn sync_with_no_counter_has_empty_payload() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let producer = SyncProducer::new(network, 0);
        producer.start(Duration::from_millis(5));
        let msg = rx.recv().unwrap();
        assert_eq!(msg.id(), SYNC_ID);
        assert_eq!(msg.data(), &[] as &[u8]);
        producer.stop();
    }

    #[tokio::test]
    async fn sync_counter_increments_and_wraps() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let producer = SyncProducer::new(network, 3);
        producer.start(Duration::from_millis(5));
        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        let third = rx.recv().unwrap();
        let fourth = rx.recv().unwrap();
        assert_eq!(first.data(), &[1]);
        assert_eq!(second.data(), &[2]);
        assert_eq!(third.data(), &[3]);
        assert_eq!(fourth.data(), &[1]);
        assert_eq!(first.id(), CanId::std(0x080));
        producer.stop();
    }
}
