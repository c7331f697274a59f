//! NMT: master command issuance, the slave state machine, and the heartbeat producer/consumer
//! pair that ride alongside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use canopen_common::messages::{
    CanId, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState, HEARTBEAT_BASE, NMT_CMD_ID,
};
use canopen_common::node_id::NodeId;
use canopen_common::traits::AsyncCanSender;

use crate::network::{Network, NetworkError, PeriodicTask};

/// Issues NMT state-transition commands to the bus. Stateless: every method sends one command
/// frame, addressed to a single node or broadcast (`node = 0`).
#[derive(Clone)]
pub struct NmtMaster<S: AsyncCanSender + 'static> {
    network: Network<S>,
}

impl<S: AsyncCanSender + 'static> NmtMaster<S> {
    /// Bind to a network
    pub fn new(network: Network<S>) -> Self {
        Self { network }
    }

    async fn send_command(&self, cs: NmtCommandSpecifier, node: u8) -> Result<(), NetworkError> {
        let cmd = NmtCommand { cs, node };
        let msg: canopen_common::messages::CanMessage = cmd.into();
        self.network.send(msg.id(), msg.data()).await
    }

    /// Command `node` (or every node, if 0) into the Operational state
    pub async fn start(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::Start, node).await
    }

    /// Command `node` (or every node, if 0) into the Stopped state
    pub async fn stop(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::Stop, node).await
    }

    /// Command `node` (or every node, if 0) into the Pre-Operational state
    pub async fn enter_pre_operational(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::EnterPreOp, node).await
    }

    /// Request an application reset on `node` (or every node, if 0)
    pub async fn reset_app(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::ResetApp, node).await
    }

    /// Request a communication reset on `node` (or every node, if 0)
    pub async fn reset_comm(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::ResetComm, node).await
    }

    /// Command `node` (or every node, if 0) into the low-power Sleep state
    pub async fn sleep(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::Sleep, node).await
    }

    /// Command `node` (or every node, if 0) into the low-power Standby state
    pub async fn standby(&self, node: u8) -> Result<(), NetworkError> {
        self.send_command(NmtCommandSpecifier::Standby, node).await
    }
}

/// Invoked whenever a slave's NMT state changes, including the automatic Bootup -> PreOperational
/// transition.
pub type StateChangeCallback = Box<dyn FnMut(NmtState) + Send>;

/// A node's own NMT state machine: listens for commands addressed to it (or broadcast),
/// transitions state, and drives a [`HeartbeatProducer`] whose period follows 0x1017.
pub struct NmtSlave<S: AsyncCanSender + 'static> {
    network: Network<S>,
    node_id: NodeId,
    state: Arc<StdMutex<NmtState>>,
    on_state_change: Arc<StdMutex<Option<StateChangeCallback>>>,
    heartbeat: HeartbeatProducer<S>,
}

impl<S: AsyncCanSender + 'static> NmtSlave<S> {
    /// Create a slave bound to `node_id`, starting in the Bootup state. Call [`NmtSlave::spawn`]
    /// once to begin listening for commands and fire the automatic Bootup transition.
    pub fn new(network: Network<S>, node_id: NodeId) -> Self {
        Self {
            heartbeat: HeartbeatProducer::new(network.clone(), node_id),
            network,
            node_id,
            state: Arc::new(StdMutex::new(NmtState::Bootup)),
            on_state_change: Arc::new(StdMutex::new(None)),
        }
    }

    /// Register a callback invoked on every state transition
    pub fn set_state_change_callback(&self, callback: impl FnMut(NmtState) + Send + 'static) {
        *self.on_state_change.lock().unwrap() = Some(Box::new(callback));
    }

    /// Current NMT state
    pub fn state(&self) -> NmtState {
        *self.state.lock().unwrap()
    }

    fn transition(state: &Arc<StdMutex<NmtState>>, cb: &Arc<StdMutex<Option<StateChangeCallback>>>, heartbeat: &HeartbeatProducer<S>, new_state: NmtState) {
        let mut guard = state.lock().unwrap();
        if *guard != new_state {
            *guard = new_state;
            drop(guard);
            heartbeat.set_state(new_state);
            if let Some(cb) = cb.lock().unwrap().as_mut() {
                cb(new_state);
            }
        }
    }

    /// Begin listening for NMT commands on this node's behalf, and fire the automatic
    /// Bootup -> PreOperational transition. The heartbeat producer itself is started separately,
    /// once OD 0x1017 is known, via [`NmtSlave::heartbeat`].
    pub fn spawn(&self) {
        let node_id = self.node_id;
        let state = self.state.clone();
        let cb = self.on_state_change.clone();
        let heartbeat = self.heartbeat.clone();

        self.network.subscribe(NMT_CMD_ID, move |msg| {
            let Ok(cmd) = NmtCommand::try_from(msg) else { return };
            if cmd.node != 0 && cmd.node != node_id.raw() {
                return;
            }
            let new_state = match cmd.cs {
                NmtCommandSpecifier::Start => NmtState::Operational,
                NmtCommandSpecifier::Stop => NmtState::Stopped,
                NmtCommandSpecifier::EnterPreOp => NmtState::PreOperational,
                NmtCommandSpecifier::ResetApp | NmtCommandSpecifier::ResetComm => NmtState::PreOperational,
                NmtCommandSpecifier::Sleep => NmtState::Sleep,
                NmtCommandSpecifier::Standby => NmtState::Standby,
            };
            Self::transition(&state, &cb, &heartbeat, new_state);
        });

        Self::transition(&self.state, &self.on_state_change, &self.heartbeat, NmtState::PreOperational);
    }

    /// The heartbeat producer backing this slave, for starting/reconfiguring its period
    pub fn heartbeat(&self) -> &HeartbeatProducer<S> {
        &self.heartbeat
    }
}

/// Sends this node's heartbeat at the configured producer time (OD index 0x1017). A period of
/// zero disables production, per the object's defined semantics.
///
/// Cheaply [`Clone`]-able; every clone shares the same underlying producer state.
pub struct HeartbeatProducer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    node_id: NodeId,
    state: Arc<StdMutex<NmtState>>,
    task: Arc<StdMutex<Option<PeriodicTask<S>>>>,
}

impl<S: AsyncCanSender + 'static> Clone for HeartbeatProducer<S> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            node_id: self.node_id,
            state: self.state.clone(),
            task: self.task.clone(),
        }
    }
}

impl<S: AsyncCanSender + 'static> HeartbeatProducer<S> {
    fn new(network: Network<S>, node_id: NodeId) -> Self {
        Self {
            network,
            node_id,
            state: Arc::new(StdMutex::new(NmtState::Bootup)),
            task: Arc::new(StdMutex::new(None)),
        }
    }

    fn frame(node_id: NodeId, state: NmtState) -> Vec<u8> {
        let msg: canopen_common::messages::CanMessage = Heartbeat { node: node_id.raw(), state }.into();
        msg.data().to_vec()
    }

    /// Update the reported state for future heartbeat frames, without changing the period
    pub fn set_state(&self, state: NmtState) {
        *self.state.lock().unwrap() = state;
        if let Some(task) = self.task.lock().unwrap().as_ref() {
            task.update(&Self::frame(self.node_id, state));
        }
    }

    /// (Re)configure the heartbeat period, per a write to OD 0x1017. Takes effect immediately:
    /// an in-flight producer is stopped and restarted at the new period. A period of zero stops
    /// production entirely.
    pub fn reconfigure(&self, period: Duration) {
        let mut task = self.task.lock().unwrap();
        if let Some(old) = task.take() {
            old.stop();
        }
        if period.is_zero() {
            return;
        }
        let id = CanId::std(HEARTBEAT_BASE + self.node_id.raw() as u16);
        let data = Self::frame(self.node_id, *self.state.lock().unwrap());
        *task = Some(self.network.send_periodic(id, &data, period));
    }
}

/// Tracks the last heartbeat seen from each monitored node and flags nodes whose consumer
/// heartbeat timeout (OD 0x1016) has elapsed without a fresh message.
#[derive(Clone)]
pub struct HeartbeatConsumer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    entries: Arc<StdMutex<HashMap<u8, ConsumerEntry>>>,
}

struct ConsumerEntry {
    timeout: Duration,
    last_state: NmtState,
    last_seen: Instant,
    notify: Arc<Notify>,
}

impl<S: AsyncCanSender + 'static> HeartbeatConsumer<S> {
    /// Create a consumer with no monitored nodes yet
    pub fn new(network: Network<S>) -> Self {
        Self {
            network,
            entries: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Start (or update) monitoring `node`, expecting a heartbeat at least every `timeout`.
    /// Subscribes to the node's heartbeat COB-ID the first time it's configured.
    pub fn watch(&self, node: NodeId, timeout: Duration) {
        let mut entries = self.entries.lock().unwrap();
        let is_new = !entries.contains_key(&node.raw());
        entries.insert(
            node.raw(),
            ConsumerEntry { timeout, last_state: NmtState::Bootup, last_seen: Instant::now(), notify: Arc::new(Notify::new()) },
        );
        drop(entries);

        if is_new {
            let entries = self.entries.clone();
            let id = CanId::std(HEARTBEAT_BASE + node.raw() as u16);
            self.network.subscribe(id, move |msg| {
                if let Some(&state_byte) = msg.data().first() {
                    if let Ok(state) = NmtState::try_from(state_byte) {
                        if let Some(entry) = entries.lock().unwrap().get_mut(&node.raw()) {
                            entry.last_state = state;
                            entry.last_seen = Instant::now();
                            entry.notify.notify_waiters();
                        }
                    }
                }
            });
        }
    }

    /// Stop monitoring `node`
    pub fn unwatch(&self, node: NodeId) {
        self.entries.lock().unwrap().remove(&node.raw());
        self.network.unsubscribe(CanId::std(HEARTBEAT_BASE + node.raw() as u16));
    }

    /// The last reported state and time since last heartbeat for each monitored node
    pub fn statuses(&self) -> HashMap<u8, (NmtState, Duration)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, e)| (id, (e.last_state, e.last_seen.elapsed())))
            .collect()
    }

    /// Node ids whose configured timeout has elapsed since their last heartbeat
    pub fn timed_out(&self) -> Vec<u8> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.last_seen.elapsed() > e.timeout)
            .map(|(&id, _)| id)
            .collect()
    }

    fn notify_for(&self, node: NodeId) -> Option<Arc<Notify>> {
        self.entries.lock().unwrap().get(&node.raw()).map(|e| e.notify.clone())
    }

    /// Suspend until the next heartbeat update from `node`, or `timeout` elapses. Returns the new
    /// state, or `None` on timeout or if `node` isn't watched.
    pub async fn wait_for_heartbeat(&self, node: NodeId, timeout: Duration) -> Option<NmtState> {
        let notify = self.notify_for(node)?;
        if tokio::time::timeout(timeout, notify.notified()).await.is_err() {
            return None;
        }
        self.entries.lock().unwrap().get(&node.raw()).map(|e| e.last_state)
    }

    /// Suspend specifically for `node`'s bootup message (state byte `0`), ignoring any other
    /// update in the meantime. Returns `None` on timeout or if `node` isn't watched.
    pub async fn wait_for_bootup(&self, node: NodeId, timeout: Duration) -> Option<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.wait_for_heartbeat(node, remaining).await {
                Some(NmtState::Bootup) => return Some(()),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::messages::CanMessage;
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
    impl canopen_common::traits::AsyncCanReceiver for NullReceiver {
        type Error = NeverError;
        fn try_recv(&mut self) -> Option<CanMessage> {
            None
        }
        fn recv(&mut self) -> impl std::future::Future<Output = Result<CanMessage, Self::Error>> + Send {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn master_sends_start_command() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let master = NmtMaster::new(network);
        master.start(5).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.id(), NMT_CMD_ID);
        assert_eq!(msg.data(), &[NmtCommandSpecifier::Start as u8, 5]);
    }

    #[tokio::test]
    async fn slave_transitions_to_operational_on_broadcast_start() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let slave = NmtSlave::new(network.clone(), NodeId::new(3).unwrap());
        slave.spawn();
        assert_eq!(slave.state(), NmtState::PreOperational);

        network.notify(CanMessage::from(NmtCommand { cs: NmtCommandSpecifier::Start, node: 0 }));
        assert_eq!(slave.state(), NmtState::Operational);
    }

    #[tokio::test]
    async fn master_sends_sleep_and_standby_commands() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let master = NmtMaster::new(network);

        master.sleep(5).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.data(), &[NmtCommandSpecifier::Sleep as u8, 5]);

        master.standby(5).await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.data(), &[NmtCommandSpecifier::Standby as u8, 5]);
    }

    #[tokio::test]
    async fn slave_transitions_to_sleep_on_command() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let slave = NmtSlave::new(network.clone(), NodeId::new(3).unwrap());
        slave.spawn();

        network.notify(CanMessage::from(NmtCommand { cs: NmtCommandSpecifier::Sleep, node: 3 }));
        assert_eq!(slave.state(), NmtState::Sleep);
    }

    #[tokio::test]
    async fn slave_ignores_command_addressed_to_other_node() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let slave = NmtSlave::new(network.clone(), NodeId::new(3).unwrap());
        slave.spawn();

        network.notify(CanMessage::from(NmtCommand { cs: NmtCommandSpecifier::Start, node: 9 }));
        assert_eq!(slave.state(), NmtState::PreOperational);
    }

    #[tokio::test]
    async fn consumer_flags_stale_node() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = HeartbeatConsumer::new(network);
        consumer.watch(NodeId::new(4).unwrap(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(consumer.timed_out(), vec![4]);
    }

    #[tokio::test]
    async fn wait_for_heartbeat_returns_new_state() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = HeartbeatConsumer::new(network.clone());
        let node = NodeId::new(4).unwrap();
        consumer.watch(node, Duration::from_secs(1));

        let network2 = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let msg: CanMessage = Heartbeat { node: 4, state: NmtState::Operational }.into();
            network2.notify(msg);
        });

        let state = consumer.wait_for_heartbeat(node, Duration::from_millis(500)).await;
        assert_eq!(state, Some(NmtState::Operational));
    }

    #[tokio::test]
    async fn wait_for_bootup_ignores_other_states_first() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let consumer = HeartbeatConsumer::new(network.clone());
        let node = NodeId::new(4).unwrap();
        consumer.watch(node, Duration::from_secs(1));

        let network2 = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let msg: CanMessage = Heartbeat { node: 4, state: NmtState::PreOperational }.into();
            network2.notify(msg);

            tokio::time::sleep(Duration::from_millis(10)).await;
            let msg: CanMessage = Heartbeat { node: 4, state: NmtState::Bootup }.into();
            network2.notify(msg);
        });

        assert!(consumer.wait_for_bootup(node, Duration::from_millis(500)).await.is_some());
    }
}
