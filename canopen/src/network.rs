//! Owns the CAN transport, demultiplexes inbound frames by CAN-ID to registered handlers, and
//! linearizes outbound sends. Every other component (SDO, PDO, NMT, EMCY, SYNC, TIME) holds a
//! cheap [`Network`] handle and never touches the transport directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use canopen_common::messages::{CanId, CanMessage};
use canopen_common::traits::{AsyncCanReceiver, AsyncCanSender};

/// A registered frame handler. Invoked synchronously from the inbound dispatch loop, so handlers
/// must be fast and non-blocking, per the library's scheduling model.
type Handler = Box<dyn FnMut(CanMessage) + Send>;

/// Failures raised by [`Network`] operations
#[derive(Debug, Snafu)]
pub enum NetworkError {
    /// The transport rejected an outbound frame
    #[snafu(display("transport send failed for {id:?}"))]
    SendFailed {
        /// The frame that could not be sent
        id: CanId,
    },
}

struct NetworkInner<S: AsyncCanSender> {
    sender: AsyncMutex<S>,
    handlers: StdMutex<HashMap<CanId, Vec<(u64, Handler)>>>,
    next_handler_id: AtomicU64,
}

/// The CANopen network coordinator.
///
/// Cheaply [`Clone`]-able; every clone shares the same transport and dispatch table. Construct
/// once per bus with [`Network::connect`] and hand clones to each [`crate::node::Node`]'s
/// SDO/PDO/NMT/EMCY endpoints.
pub struct Network<S: AsyncCanSender + 'static> {
    inner: Arc<NetworkInner<S>>,
    _inbound: Arc<JoinHandle<()>>,
}

impl<S: AsyncCanSender + 'static> Clone for Network<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _inbound: self._inbound.clone(),
        }
    }
}

impl<S: AsyncCanSender + 'static> Network<S> {
    /// Acquire the CAN transport and start the dedicated inbound dispatch task.
    ///
    /// `sender`/`receiver` are the two halves of the pluggable `CanBus`; how they're obtained
    /// (socketcan, a simulator, a test double) is outside this crate.
    pub fn connect<R>(sender: S, mut receiver: R) -> Self
    where
        R: AsyncCanReceiver + 'static,
    {
        let inner = Arc::new(NetworkInner {
            sender: AsyncMutex::new(sender),
            handlers: StdMutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
        });

        let dispatch_inner = inner.clone();
        let inbound = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => Self::dispatch(&dispatch_inner, msg),
                    Err(e) => {
                        log::warn!("CAN receive error: {e:?}");
                    }
                }
            }
        });

        Self {
            inner,
            _inbound: Arc::new(inbound),
        }
    }

    fn dispatch(inner: &NetworkInner<S>, msg: CanMessage) {
        let mut handlers = inner.handlers.lock().unwrap();
        if let Some(list) = handlers.get_mut(&msg.id()) {
            for (_, handler) in list.iter_mut() {
                handler(msg);
            }
        }
    }

    /// Register a handler invoked for each frame received at `can_id`. Multiple handlers per ID
    /// are allowed and run in insertion order.
    pub fn subscribe(&self, can_id: CanId, handler: impl FnMut(CanMessage) + Send + 'static) {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers
            .entry(can_id)
            .or_default()
            .push((id, Box::new(handler)));
    }

    /// Remove every handler registered for `can_id`.
    pub fn unsubscribe(&self, can_id: CanId) {
        self.inner.handlers.lock().unwrap().remove(&can_id);
    }

    /// Enqueue a frame for transmission.
    pub async fn send(&self, id: CanId, data: &[u8]) -> Result<(), NetworkError> {
        let msg = CanMessage::new(id, data);
        self.send_message(msg).await
    }

    /// Enqueue a remote-transmit-request frame.
    pub async fn send_rtr(&self, id: CanId) -> Result<(), NetworkError> {
        self.send_message(CanMessage::new_rtr(id)).await
    }

    async fn send_message(&self, msg: CanMessage) -> Result<(), NetworkError> {
        let mut sender = self.inner.sender.lock().await;
        sender.send(msg).await.map_err(|_| NetworkError::SendFailed { id: msg.id() })
    }

    /// Start sending `data` at `can_id` every `period`, returning a handle to update or stop it.
    pub fn send_periodic(&self, id: CanId, data: &[u8], period: Duration) -> PeriodicTask<S> {
        let task = PeriodicTask::new(self.clone(), id, data.to_vec());
        task.start(period);
        task
    }

    /// Feed a frame into the dispatcher. The normal entry point is the inbound task spawned by
    /// `connect`; this is also the hook tests use to simulate received traffic.
    pub fn notify(&self, msg: CanMessage) {
        Self::dispatch(&self.inner, msg);
    }
}

/// A handle to a periodically-transmitted frame, returned by [`Network::send_periodic`].
///
/// A transport send failure inside the periodic loop is logged and the task continues ticking;
/// a stalled transport never wedges the dispatcher.
pub struct PeriodicTask<S: AsyncCanSender + 'static> {
    network: Network<S>,
    id: CanId,
    data: Arc<StdMutex<Vec<u8>>>,
    period: StdMutex<Duration>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: AsyncCanSender + 'static> PeriodicTask<S> {
    fn new(network: Network<S>, id: CanId, data: Vec<u8>) -> Self {
        Self {
            network,
            id,
            data: Arc::new(StdMutex::new(data)),
            period: StdMutex::new(Duration::from_millis(0)),
            handle: StdMutex::new(None),
        }
    }

    fn start(&self, period: Duration) {
        *self.period.lock().unwrap() = period;
        let network = self.network.clone();
        let id = self.id;
        let data = self.data.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let payload = data.lock().unwrap().clone();
                if let Err(e) = network.send(id, &payload).await {
                    log::warn!("periodic send to {id:?} failed: {e}");
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Replace the payload sent on the next tick.
    pub fn update(&self, new_data: &[u8]) {
        *self.data.lock().unwrap() = new_data.to_vec();
    }

    /// Cancel the periodic send. At most one extra frame may already be in flight.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Resume periodic sending at the previously configured period. Permitted after `stop()`.
    pub fn restart(&self) {
        if self.handle.lock().unwrap().is_some() {
            return;
        }
        let period = *self.period.lock().unwrap();
        self.start(period);
    }
}

impl<S: AsyncCanSender + 'static> Drop for PeriodicTask<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn subscribe_and_notify() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx: tx.clone() }, NullReceiver);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        network.subscribe(CanId::std(0x123), move |msg| {
            received_clone.lock().unwrap().push(msg);
        });

        network.notify(CanMessage::new(CanId::std(0x123), &[1, 2, 3]));
        network.notify(CanMessage::new(CanId::std(0x456), &[9]));

        assert_eq!(received.lock().unwrap().len(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let count = Arc::new(StdMutex::new(0));
        let count_clone = count.clone();
        network.subscribe(CanId::std(0x80), move |_| {
            *count_clone.lock().unwrap() += 1;
        });
        network.notify(CanMessage::new(CanId::std(0x80), &[]));
        network.unsubscribe(CanId::std(0x80));
        network.notify(CanMessage::new(CanId::std(0x80), &[]));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn send_reaches_transport() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        network.send(CanId::std(0x602), &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.id(), CanId::std(0x602));
    }
}
