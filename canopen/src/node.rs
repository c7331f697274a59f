//! Node: binds one node-id to its SDO/PDO/NMT/EMCY endpoints and its Object Dictionary.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use canopen_common::messages::{CanId, RPDO_BASE, TPDO_BASE};
use canopen_common::node_id::NodeId;
use canopen_common::object_dictionary::ObjectDictionary;
use canopen_common::traits::AsyncCanSender;

use crate::emcy::{EmcyConsumer, EmcyProducer};
use crate::error::Error;
use crate::network::Network;
use crate::nmt::{NmtMaster, NmtSlave};
use crate::pdo::{Rpdo, Tpdo};
use crate::sdo_client::SdoClient;
use crate::sdo_server::{SdoServer, WriteCallback};
use crate::sync::SyncProducer;
use crate::time::TimeProducer;

/// OD index of the producer heartbeat time, whose writes take effect immediately per this
/// stack's resolution of the object's ambiguous timing.
const PRODUCER_HEARTBEAT_TIME: u16 = 0x1017;

/// A local CANopen node: one node-id's Object Dictionary plus every protocol endpoint bound to
/// it. Construct one per device the process represents; `sdo_client`/`nmt_master` remain usable
/// to address *other* nodes on the same network.
pub struct Node<S: AsyncCanSender + 'static> {
    /// This node's address
    pub node_id: NodeId,
    /// The Object Dictionary this node serves over SDO and maps into PDOs
    pub od: Arc<ObjectDictionary>,
    network: Network<S>,
    /// Client for issuing SDO requests to other nodes (or back to this one, in loopback tests)
    pub sdo_client: SdoClient<S>,
    /// Master-side NMT command issuance, addressed to other nodes
    pub nmt_master: NmtMaster<S>,
    /// This node's own NMT state machine and heartbeat producer
    pub nmt_slave: NmtSlave<S>,
    /// Sends this node's own emergency messages
    pub emcy_producer: EmcyProducer<S>,
    /// Watches emergency messages from other nodes this node has chosen to monitor
    pub emcy_consumer: EmcyConsumer<S>,
    /// SYNC producer, if this node is the SYNC master (inactive until `start()`ed)
    pub sync_producer: SyncProducer<S>,
    /// TIME producer, if this node is the time source (inactive until `start()`ed)
    pub time_producer: TimeProducer<S>,
    /// TPDO1..4, indexed 0..3
    pub tpdos: Vec<Arc<Tpdo<S>>>,
    /// RPDO1..4, indexed 0..3
    pub rpdos: Vec<Arc<Rpdo<S>>>,
    sdo_server_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: AsyncCanSender + 'static> Node<S> {
    /// Build every endpoint for `node_id` against `od`, but start nothing yet: call
    /// [`Node::spawn`] to begin serving SDO and NMT, and each TPDO's/RPDO's own `start`/
    /// `subscribe` to begin PDO traffic.
    pub fn new(network: Network<S>, node_id: NodeId, od: Arc<ObjectDictionary>) -> Self {
        let tpdos = TPDO_BASE
            .iter()
            .map(|base| Arc::new(Tpdo::new(network.clone(), od.clone(), CanId::std(base + node_id.raw() as u16))))
            .collect();
        let rpdos = RPDO_BASE
            .iter()
            .map(|base| Arc::new(Rpdo::new(network.clone(), od.clone(), CanId::std(base + node_id.raw() as u16))))
            .collect();

        Self {
            node_id,
            network: network.clone(),
            sdo_client: SdoClient::new(network.clone(), node_id),
            nmt_master: NmtMaster::new(network.clone()),
            nmt_slave: NmtSlave::new(network.clone(), node_id),
            emcy_producer: EmcyProducer::new(network.clone(), node_id),
            emcy_consumer: EmcyConsumer::new(network.clone()),
            sync_producer: SyncProducer::new(network.clone(), 0),
            time_producer: TimeProducer::new(network.clone()),
            tpdos,
            rpdos,
            od,
            sdo_server_task: std::sync::Mutex::new(None),
        }
    }

    /// Start serving SDO requests against this node's OD, and begin the NMT slave state machine.
    /// Wires OD writes to `0x1017` (producer heartbeat time) to take effect immediately, per this
    /// stack's chosen resolution of that object's timing.
    pub fn spawn(&self) {
        let heartbeat = self.nmt_slave.heartbeat().clone();
        let write_heartbeat_time: WriteCallback = Arc::new(move |index, sub, data| {
            if index == PRODUCER_HEARTBEAT_TIME && sub == 0 && data.len() == 2 {
                let millis = u16::from_le_bytes([data[0], data[1]]);
                if millis == 0 {
                    heartbeat.reconfigure(Duration::from_millis(0));
                } else {
                    heartbeat.reconfigure(Duration::from_millis(millis as u64));
                }
            }
            false
        });

        let mut server = SdoServer::new(self.network.clone(), self.node_id, self.od.clone());
        server.add_write_callback(write_heartbeat_time);
        let handle = server.spawn();
        *self.sdo_server_task.lock().unwrap() = Some(handle);

        self.nmt_slave.spawn();
        for rpdo in &self.rpdos {
            rpdo.subscribe();
        }
    }

    /// Read this node's producer heartbeat time directly from the OD and start (or restart) the
    /// heartbeat at that period. A stored value of 0 leaves the producer stopped.
    pub fn start_heartbeat_from_od(&self) -> Result<(), Error> {
        let var = self.od.variable(PRODUCER_HEARTBEAT_TIME, 0)?;
        let millis = var.value().as_i64().max(0) as u64;
        if millis > 0 {
            self.nmt_slave.heartbeat().reconfigure(Duration::from_millis(millis));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::codec::{DataType, Value};
    use canopen_common::messages::CanMessage;
    use canopen_common::object_dictionary::{AccessType, Variable};
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

    fn sample_od() -> Arc<ObjectDictionary> {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x1017, 0, "producer_heartbeat_time", DataType::Unsigned16, AccessType::Rw, Value::Uint(0)));
        Arc::new(od)
    }

    #[tokio::test]
    async fn node_builds_four_tpdos_and_rpdos_at_predefined_cob_ids() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let node = Node::new(network, NodeId::new(5).unwrap(), sample_od());
        assert_eq!(node.tpdos.len(), 4);
        assert_eq!(node.rpdos.len(), 4);
        assert_eq!(node.tpdos[0].cob_id(), CanId::std(0x180 + 5));
        assert_eq!(node.rpdos[3].mappings().len(), 0);
    }

    #[tokio::test]
    async fn spawn_wires_heartbeat_time_write_to_producer() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let node = Node::new(network, NodeId::new(5).unwrap(), sample_od());
        node.spawn();

        node.sdo_client.download_u16(0x1017, 0, 50).await.unwrap();

        assert_eq!(node.od.variable(0x1017, 0).unwrap().value(), Value::Uint(50));
    }
}
