//! TIME: the time-of-day producer.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use canopen_common::messages::{TimeOfDay, TIME_ID};
use canopen_common::traits::AsyncCanSender;

use crate::network::Network;

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Converts a Unix timestamp, in whole seconds, into the wire representation used by the TIME
/// object: milliseconds since midnight and days elapsed, both counted from the Unix epoch.
pub fn time_of_day_from_unix_secs(unix_secs: u64) -> TimeOfDay {
    let total_ms = unix_secs * 1000;
    TimeOfDay {
        ms_since_midnight: (total_ms % MS_PER_DAY) as u32,
        days: (total_ms / MS_PER_DAY) as u16,
    }
}

/// Produces TIME messages at COB-ID 0x100, either once on demand or periodically.
pub struct TimeProducer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: AsyncCanSender + 'static> TimeProducer<S> {
    /// Create a producer bound to the network's TIME COB-ID.
    pub fn new(network: Network<S>) -> Self {
        Self {
            network,
            handle: StdMutex::new(None),
        }
    }

    /// Send a single TIME frame for the given Unix timestamp (whole seconds).
    pub async fn send_at(&self, unix_secs: u64) -> Result<(), crate::network::NetworkError> {
        let tod = time_of_day_from_unix_secs(unix_secs);
        let bytes: [u8; 6] = tod.into();
        self.network.send(TIME_ID, &bytes).await
    }

    /// Send a single TIME frame for the current wall-clock time.
    pub async fn send_now(&self) -> Result<(), crate::network::NetworkError> {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.send_at(unix_secs).await
    }

    /// Start sending the current time every `period`. Replaces any previously running producer.
    pub fn start(&self, period: Duration) {
        self.stop();
        let network = self.network.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let unix_secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let tod = time_of_day_from_unix_secs(unix_secs);
                let bytes: [u8; 6] = tod.into();
                if let Err(e) = network.send(TIME_ID, &bytes).await {
                    log::warn!("TIME send failed: {e}");
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop the periodic TIME producer.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl<S: AsyncCanSender + 'static> Drop for TimeProducer<S> {
    fn drop(&mut self) {
        self.stop();
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

    #[test]
    fn encodes_reference_timestamp() {
        let tod = time_of_day_from_unix_secs(1486236238);
        let bytes: [u8; 6] = tod.into();
        assert_eq!(bytes, [0xB0, 0xA4, 0x29, 0x04, 0x31, 0x43]);
    }

    #[tokio::test]
    async fn send_at_emits_frame_at_time_cob_id() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let producer = TimeProducer::new(network);
        producer.send_at(1486236238).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.id(), TIME_ID);
        assert_eq!(msg.data(), &[0xB0, 0xA4, 0x29, 0x04, 0x31, 0x43]);
    }
}
