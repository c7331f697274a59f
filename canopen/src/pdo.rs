//! PDO engine: bit-packed, cyclic transfer of mapped Object Dictionary entries.
//!
//! A [`PdoMapping`] names one mapped OD entry and its bit width within the frame; a TPDO packs its
//! mapped entries into an outgoing frame, an RPDO unpacks an incoming one back into the OD.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use canopen_common::messages::CanId;
use canopen_common::object_dictionary::ObjectDictionary;
use canopen_common::traits::AsyncCanSender;

use crate::error::Error;
use crate::network::{Network, PeriodicTask};

/// Maximum total mapped bit length for a single PDO frame.
const MAX_PDO_BITS: usize = 64;

/// One entry in a PDO mapping table: the OD location and the bit width it occupies in the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoMapping {
    /// Mapped object index
    pub index: u16,
    /// Mapped object sub-index
    pub sub: u8,
    /// Width, in bits, this entry occupies in the packed frame
    pub bit_length: u8,
}

impl PdoMapping {
    /// Decode a CiA 301 mapping word: `index:16 | subindex:8 | length:8` (length in bits).
    pub fn from_word(word: u32) -> Self {
        Self {
            index: (word >> 16) as u16,
            sub: ((word >> 8) & 0xFF) as u8,
            bit_length: (word & 0xFF) as u8,
        }
    }

    /// Encode this entry back into a CiA 301 mapping word.
    pub fn to_word(self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.bit_length as u32
    }
}

fn total_bits(mappings: &[PdoMapping]) -> usize {
    mappings.iter().map(|m| m.bit_length as usize).sum()
}

fn check_bit_budget(mappings: &[PdoMapping]) -> Result<(), Error> {
    let total = total_bits(mappings);
    if total > MAX_PDO_BITS {
        return Err(Error::Configuration {
            reason: format!("PDO mapping totals {total} bits, exceeding the {MAX_PDO_BITS}-bit limit"),
        });
    }
    Ok(())
}

fn write_bits_to_frame(frame: &mut [u8], bit_offset: usize, bit_length: usize, value: u64) {
    for i in 0..bit_length {
        let dest = bit_offset + i;
        let byte_idx = dest / 8;
        let bit_idx = dest % 8;
        if (value >> i) & 1 != 0 {
            frame[byte_idx] |= 1 << bit_idx;
        } else {
            frame[byte_idx] &= !(1 << bit_idx);
        }
    }
}

fn read_bits_from_frame(frame: &[u8], bit_offset: usize, bit_length: usize) -> u64 {
    let mut value = 0u64;
    for i in 0..bit_length {
        let src = bit_offset + i;
        let byte_idx = src / 8;
        let bit_idx = src % 8;
        if byte_idx >= frame.len() {
            break;
        }
        let bit = (frame[byte_idx] >> bit_idx) & 1;
        value |= (bit as u64) << i;
    }
    value
}

fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate().take(8) {
        value |= (*b as u64) << (8 * i);
    }
    value
}

fn u64_to_le_bytes(value: u64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[0..width].to_vec()
}

/// Pack every mapped entry's current raw OD value into a frame, in mapping order starting at bit
/// 0. The frame is sized to the smallest whole number of bytes holding the total mapped bits.
pub fn pack_frame(od: &ObjectDictionary, mappings: &[PdoMapping]) -> Result<Vec<u8>, Error> {
    check_bit_budget(mappings)?;
    let total = total_bits(mappings);
    let mut frame = vec![0u8; total.div_ceil(8)];
    let mut bit_offset = 0usize;
    for map in mappings {
        let raw = od.raw_read(map.index, map.sub)?;
        let full = le_bytes_to_u64(&raw);
        let length = map.bit_length as usize;
        let mask = if length >= 64 { u64::MAX } else { (1u64 << length) - 1 };
        write_bits_to_frame(&mut frame, bit_offset, length, full & mask);
        bit_offset += length;
    }
    Ok(frame)
}

/// Unpack a received frame into every mapped entry's OD location, sign-extending signed types
/// narrower than their natural width before writing back.
pub fn unpack_frame(od: &ObjectDictionary, mappings: &[PdoMapping], data: &[u8]) -> Result<(), Error> {
    check_bit_budget(mappings)?;
    let mut bit_offset = 0usize;
    for map in mappings {
        let length = map.bit_length as usize;
        let mut value = read_bits_from_frame(data, bit_offset, length);
        let var = od.variable(map.index, map.sub)?;
        let natural_width = var.data_type.fixed_width().unwrap_or(8);
        if var.data_type.is_signed() && length < natural_width * 8 && length > 0 {
            let sign_bit = 1u64 << (length - 1);
            if value & sign_bit != 0 {
                value |= !0u64 << length;
            }
        }
        let bytes = u64_to_le_bytes(value, natural_width);
        od.raw_write(map.index, map.sub, &bytes)?;
        bit_offset += length;
    }
    Ok(())
}

/// COB-ID bit marking a PDO communication-parameter record disabled.
const COB_ID_INVALID: u32 = 1 << 31;
/// COB-ID bit disabling RTR-triggered transmission.
const COB_ID_NO_RTR: u32 = 1 << 30;
/// COB-ID bit marking the identifier 29-bit extended.
const COB_ID_EXTENDED: u32 = 1 << 29;

/// The full communication and mapping configuration of one PDO, as read from or written to a
/// remote node's communication-parameter and mapping-parameter records over SDO.
#[derive(Clone, Debug)]
pub struct PdoConfig {
    /// COB-ID used for this PDO
    pub cob_id: CanId,
    /// Communication-parameter sub 1 bit 31: PDO disabled
    pub valid: bool,
    /// Communication-parameter sub 1 bit 30: RTR disabled
    pub rtr_disabled: bool,
    /// Communication-parameter sub 2
    pub transmission_type: u8,
    /// Communication-parameter sub 3, present only for asynchronous transmission types
    pub inhibit_time: u16,
    /// Communication-parameter sub 5
    pub event_timer: u16,
    /// Communication-parameter sub 6
    pub sync_start: u8,
    /// Mapping-parameter records, sub 1..n
    pub mappings: Vec<PdoMapping>,
}

fn cob_id_word(cob_id: CanId, valid: bool, rtr_disabled: bool) -> u32 {
    let mut word = cob_id.raw();
    if cob_id.is_extended() {
        word |= COB_ID_EXTENDED;
    }
    if rtr_disabled {
        word |= COB_ID_NO_RTR;
    }
    if !valid {
        word |= COB_ID_INVALID;
    }
    word
}

fn cob_id_from_word(word: u32) -> (CanId, bool, bool) {
    let valid = word & COB_ID_INVALID == 0;
    let rtr_disabled = word & COB_ID_NO_RTR != 0;
    let cob_id = if word & COB_ID_EXTENDED != 0 {
        CanId::Extended(word & 0x1FFF_FFFF)
    } else {
        CanId::Std((word & 0x7FF) as u16)
    };
    (cob_id, valid, rtr_disabled)
}

/// Read a PDO's communication and mapping parameters from a remote node over SDO, per the
/// `com[1..6]` / `map[0..n]` layout shared by RPDO and TPDO records.
pub async fn read_config<S: AsyncCanSender + 'static>(
    sdo: &crate::sdo_client::SdoClient<S>,
    comm_index: u16,
    map_index: u16,
) -> Result<PdoConfig, Error> {
    let cob_word = sdo.upload_u32(comm_index, 1).await?;
    let (cob_id, valid, rtr_disabled) = cob_id_from_word(cob_word);
    let transmission_type = sdo.upload_u8(comm_index, 2).await?;
    let inhibit_time = sdo.upload_u16(comm_index, 3).await.unwrap_or(0);
    let event_timer = sdo.upload_u16(comm_index, 5).await.unwrap_or(0);
    let sync_start = sdo.upload_u8(comm_index, 6).await.unwrap_or(0);

    let map_count = sdo.upload_u8(map_index, 0).await?;
    let mut mappings = Vec::with_capacity(map_count as usize);
    for sub in 1..=map_count {
        let word = sdo.upload_u32(map_index, sub).await?;
        if word != 0 {
            mappings.push(PdoMapping::from_word(word));
        }
    }

    Ok(PdoConfig {
        cob_id,
        valid,
        rtr_disabled,
        transmission_type,
        inhibit_time,
        event_timer,
        sync_start,
        mappings,
    })
}

/// Write a PDO's communication and mapping parameters to a remote node over SDO: disables the
/// PDO, writes every parameter and mapping, overwrites any excess prior mapping entries with
/// dummy (`0x00000000`) records, then re-enables if `config.valid`.
pub async fn save_config<S: AsyncCanSender + 'static>(
    sdo: &crate::sdo_client::SdoClient<S>,
    comm_index: u16,
    map_index: u16,
    config: &PdoConfig,
    prior_map_count: u8,
) -> Result<(), Error> {
    check_bit_budget(&config.mappings)?;

    let disabled_word = cob_id_word(config.cob_id, false, config.rtr_disabled);
    sdo.download_u32(comm_index, 1, disabled_word).await?;

    sdo.download_u8(comm_index, 2, config.transmission_type).await?;
    let _ = sdo.download_u16(comm_index, 3, config.inhibit_time).await;
    let _ = sdo.download_u16(comm_index, 5, config.event_timer).await;
    let _ = sdo.download_u8(comm_index, 6, config.sync_start).await;

    for (i, map) in config.mappings.iter().enumerate() {
        sdo.download_u32(map_index, (i + 1) as u8, map.to_word()).await?;
    }
    for sub in (config.mappings.len() as u8 + 1)..=prior_map_count {
        sdo.download_u32(map_index, sub, 0).await?;
    }
    // If sub0 is read-only on this node, the write is rejected and ignored; the dummy mappings
    // above already erased any entries beyond the new count.
    let _ = sdo.download_u8(map_index, 0, config.mappings.len() as u8).await;

    if config.valid {
        let enabled_word = cob_id_word(config.cob_id, true, config.rtr_disabled);
        sdo.download_u32(comm_index, 1, enabled_word).await?;
    }

    Ok(())
}

/// A single TPDO: packs mapped OD entries and transmits them, once or periodically.
pub struct Tpdo<S: AsyncCanSender + 'static> {
    network: Network<S>,
    od: Arc<ObjectDictionary>,
    cob_id: StdMutex<CanId>,
    valid: std::sync::atomic::AtomicBool,
    mappings: StdMutex<Vec<PdoMapping>>,
    task: StdMutex<Option<PeriodicTask<S>>>,
}

impl<S: AsyncCanSender + 'static> Tpdo<S> {
    /// Create a TPDO bound to `cob_id` with an empty mapping table.
    pub fn new(network: Network<S>, od: Arc<ObjectDictionary>, cob_id: CanId) -> Self {
        Self {
            network,
            od,
            cob_id: StdMutex::new(cob_id),
            valid: std::sync::atomic::AtomicBool::new(true),
            mappings: StdMutex::new(Vec::new()),
            task: StdMutex::new(None),
        }
    }

    /// Replace the mapping table, validating the 64-bit budget.
    pub fn set_mappings(&self, mappings: Vec<PdoMapping>) -> Result<(), Error> {
        check_bit_budget(&mappings)?;
        *self.mappings.lock().unwrap() = mappings;
        Ok(())
    }

    /// The current mapping table.
    pub fn mappings(&self) -> Vec<PdoMapping> {
        self.mappings.lock().unwrap().clone()
    }

    /// Set the COB-ID used for transmission.
    pub fn set_cob_id(&self, cob_id: CanId) {
        *self.cob_id.lock().unwrap() = cob_id;
    }

    /// Current COB-ID.
    pub fn cob_id(&self) -> CanId {
        *self.cob_id.lock().unwrap()
    }

    /// Disable or re-enable the PDO (communication parameter COB-ID bit 31).
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
    }

    /// Whether the PDO is currently enabled.
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    fn pack(&self) -> Result<Vec<u8>, Error> {
        pack_frame(&self.od, &self.mappings.lock().unwrap())
    }

    /// Send the current payload once, regardless of any running periodic task.
    pub async fn transmit(&self) -> Result<(), Error> {
        if !self.valid() {
            return Ok(());
        }
        let payload = self.pack()?;
        self.network.send(self.cob_id(), &payload).await?;
        Ok(())
    }

    /// Launch a periodic task sending the current payload every `period`. Replaces any previous
    /// task bound to this PDO.
    pub fn start(&self, period: Duration) -> Result<(), Error> {
        let payload = self.pack()?;
        let mut task = self.task.lock().unwrap();
        if let Some(old) = task.take() {
            old.stop();
        }
        *task = Some(self.network.send_periodic(self.cob_id(), &payload, period));
        Ok(())
    }

    /// Re-pack the current OD values and push them into the running periodic task, if any.
    pub fn update(&self) -> Result<(), Error> {
        let payload = self.pack()?;
        if let Some(task) = self.task.lock().unwrap().as_ref() {
            task.update(&payload);
        }
        Ok(())
    }

    /// Cancel the periodic task. `start()` may be called again afterward.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.stop();
        }
    }

    /// True while a periodic task is running; used by a same-COB-ID RPDO to suppress self-echo.
    pub fn is_active(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }
}

/// Invoked on every successfully unpacked RPDO reception.
pub type PdoCallback = Box<dyn FnMut(&[u8]) + Send>;

/// A single RPDO: unpacks received frames into mapped OD entries.
pub struct Rpdo<S: AsyncCanSender + 'static> {
    network: Network<S>,
    od: Arc<ObjectDictionary>,
    cob_id: CanId,
    mappings: StdMutex<Vec<PdoMapping>>,
    last_received: Arc<StdMutex<Option<(Vec<u8>, Instant)>>>,
    last_period_millis: Arc<AtomicU64>,
    notify: Arc<Notify>,
    callbacks: Arc<StdMutex<Vec<PdoCallback>>>,
    echo_guard: StdMutex<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
}

impl<S: AsyncCanSender + 'static> Rpdo<S> {
    /// Create an RPDO bound to `cob_id` with an empty mapping table. Call [`Rpdo::subscribe`] to
    /// start receiving.
    pub fn new(network: Network<S>, od: Arc<ObjectDictionary>, cob_id: CanId) -> Self {
        Self {
            network,
            od,
            cob_id,
            mappings: StdMutex::new(Vec::new()),
            last_received: Arc::new(StdMutex::new(None)),
            last_period_millis: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
            callbacks: Arc::new(StdMutex::new(Vec::new())),
            echo_guard: StdMutex::new(None),
        }
    }

    /// Replace the mapping table, validating the 64-bit budget.
    pub fn set_mappings(&self, mappings: Vec<PdoMapping>) -> Result<(), Error> {
        check_bit_budget(&mappings)?;
        *self.mappings.lock().unwrap() = mappings;
        Ok(())
    }

    /// The current mapping table.
    pub fn mappings(&self) -> Vec<PdoMapping> {
        self.mappings.lock().unwrap().clone()
    }

    /// Suppress reception while `guard` returns true — used to ignore a locally transmitted
    /// frame that shares this RPDO's COB-ID with one of this node's own TPDOs.
    pub fn set_echo_guard(&self, guard: impl Fn() -> bool + Send + Sync + 'static) {
        *self.echo_guard.lock().unwrap() = Some(Box::new(guard));
    }

    /// Register a callback invoked, in registration order, after every successful reception.
    pub fn add_callback(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Subscribe to this PDO's COB-ID on the network, starting reception.
    pub fn subscribe(self: &Arc<Self>) {
        let this = self.clone();
        self.network.subscribe(self.cob_id, move |msg| {
            this.on_message(msg.data());
        });
    }

    fn on_message(&self, data: &[u8]) {
        if let Some(guard) = self.echo_guard.lock().unwrap().as_ref() {
            if guard() {
                return;
            }
        }

        let mappings = self.mappings.lock().unwrap().clone();
        if unpack_frame(&self.od, &mappings, data).is_err() {
            return;
        }

        let now = Instant::now();
        {
            let mut last = self.last_received.lock().unwrap();
            if let Some((_, prev)) = last.as_ref() {
                let period_ms = now.saturating_duration_since(*prev).as_millis() as u64;
                self.last_period_millis.store(period_ms, Ordering::Relaxed);
            }
            *last = Some((data.to_vec(), now));
        }
        self.notify.notify_waiters();

        for cb in self.callbacks.lock().unwrap().iter_mut() {
            cb(data);
        }
    }

    /// The most recently measured inter-arrival period, or zero if fewer than two frames have
    /// arrived.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.last_period_millis.load(Ordering::Relaxed))
    }

    /// The timestamp of the last received frame, if any.
    pub fn last_received_at(&self) -> Option<Instant> {
        self.last_received.lock().unwrap().as_ref().map(|(_, ts)| *ts)
    }

    /// Block until the next frame arrives or `timeout` elapses, returning the receive timestamp.
    pub async fn wait_for_reception(&self, timeout: Duration) -> Option<Instant> {
        let before = self.last_received_at();
        let waited = tokio::time::timeout(timeout, self.notify.notified()).await;
        if waited.is_err() {
            return None;
        }
        let after = self.last_received_at();
        if after != before { after } else { None }
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

    fn sample_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x6000, 1, "a", DataType::Integer16, AccessType::Rw, Value::Int(-3)));
        od.insert_variable(Variable::new(0x6000, 2, "b", DataType::Unsigned8, AccessType::Rw, Value::Uint(0x0F)));
        od.insert_variable(Variable::new(0x6000, 3, "c", DataType::Integer8, AccessType::Rw, Value::Int(-2)));
        od.insert_variable(Variable::new(0x6000, 4, "d", DataType::Integer32, AccessType::Rw, Value::Int(0x01020304)));
        od.insert_variable(Variable::new(0x6000, 5, "e", DataType::Boolean, AccessType::Rw, Value::Uint(0)));
        od.insert_variable(Variable::new(0x6000, 6, "f", DataType::Boolean, AccessType::Rw, Value::Uint(1)));
        od
    }

    fn sample_mappings() -> Vec<PdoMapping> {
        vec![
            PdoMapping { index: 0x6000, sub: 1, bit_length: 16 },
            PdoMapping { index: 0x6000, sub: 2, bit_length: 4 },
            PdoMapping { index: 0x6000, sub: 3, bit_length: 4 },
            PdoMapping { index: 0x6000, sub: 4, bit_length: 32 },
            PdoMapping { index: 0x6000, sub: 5, bit_length: 1 },
            PdoMapping { index: 0x6000, sub: 6, bit_length: 1 },
        ]
    }

    #[test]
    fn packs_mixed_width_signed_fields() {
        let od = sample_od();
        let frame = pack_frame(&od, &sample_mappings()).unwrap();
        assert_eq!(frame, vec![0xFD, 0xFF, 0xEF, 0x04, 0x03, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn unpack_round_trips_through_od() {
        let od = sample_od();
        let mappings = sample_mappings();
        let frame = pack_frame(&od, &mappings).unwrap();
        let fresh = sample_od();
        unpack_frame(&fresh, &mappings, &frame).unwrap();
        assert_eq!(fresh.variable(0x6000, 1).unwrap().value(), Value::Int(-3));
        assert_eq!(fresh.variable(0x6000, 3).unwrap().value(), Value::Int(-2));
        assert_eq!(fresh.variable(0x6000, 6).unwrap().value(), Value::Bool(true));
    }

    #[test]
    fn sub_byte_signed_fields_cross_byte_boundaries() {
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x6001, 1, "w1", DataType::Integer8, AccessType::Rw, Value::Int(-1)));
        od.insert_variable(Variable::new(0x6001, 2, "w3", DataType::Integer8, AccessType::Rw, Value::Int(-4)));
        od.insert_variable(Variable::new(0x6001, 3, "w7", DataType::Integer16, AccessType::Rw, Value::Int(-60)));
        od.insert_variable(Variable::new(0x6001, 4, "w13", DataType::Integer16, AccessType::Rw, Value::Int(-4000)));

        let mappings = vec![
            PdoMapping { index: 0x6001, sub: 1, bit_length: 1 },
            PdoMapping { index: 0x6001, sub: 2, bit_length: 3 },
            PdoMapping { index: 0x6001, sub: 3, bit_length: 7 },
            PdoMapping { index: 0x6001, sub: 4, bit_length: 13 },
        ];
        let frame = pack_frame(&od, &mappings).unwrap();

        let fresh = ObjectDictionary::new();
        let mut fresh = fresh;
        fresh.insert_variable(Variable::new(0x6001, 1, "w1", DataType::Integer8, AccessType::Rw, Value::Int(0)));
        fresh.insert_variable(Variable::new(0x6001, 2, "w3", DataType::Integer8, AccessType::Rw, Value::Int(0)));
        fresh.insert_variable(Variable::new(0x6001, 3, "w7", DataType::Integer16, AccessType::Rw, Value::Int(0)));
        fresh.insert_variable(Variable::new(0x6001, 4, "w13", DataType::Integer16, AccessType::Rw, Value::Int(0)));
        unpack_frame(&fresh, &mappings, &frame).unwrap();

        assert_eq!(fresh.variable(0x6001, 1).unwrap().value(), Value::Int(-1));
        assert_eq!(fresh.variable(0x6001, 2).unwrap().value(), Value::Int(-4));
        assert_eq!(fresh.variable(0x6001, 3).unwrap().value(), Value::Int(-60));
        assert_eq!(fresh.variable(0x6001, 4).unwrap().value(), Value::Int(-4000));
    }

    #[test]
    fn oversized_mapping_is_rejected() {
        let od = sample_od();
        let mappings = vec![PdoMapping { index: 0x6000, sub: 4, bit_length: 65 }];
        assert!(matches!(pack_frame(&od, &mappings), Err(Error::Configuration { .. })));
    }

    #[test]
    fn cob_id_word_round_trips_disabled_and_no_rtr() {
        let word = cob_id_word(CanId::std(0x204), false, true);
        assert_eq!(word & COB_ID_INVALID, COB_ID_INVALID);
        let (cob_id, valid, rtr_disabled) = cob_id_from_word(word);
        assert_eq!(cob_id, CanId::std(0x204));
        assert!(!valid);
        assert!(rtr_disabled);
    }

    #[test]
    fn mapping_word_round_trips() {
        let map = PdoMapping { index: 0x6000, sub: 4, bit_length: 32 };
        assert_eq!(PdoMapping::from_word(map.to_word()), map);
    }

    #[tokio::test]
    async fn tpdo_transmit_sends_packed_frame() {
        let (tx, rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let od = Arc::new(sample_od());
        let tpdo = Tpdo::new(network, od, CanId::std(0x184));
        tpdo.set_mappings(sample_mappings()).unwrap();
        tpdo.transmit().await.unwrap();
        let msg = rx.recv().unwrap();
        assert_eq!(msg.data(), &[0xFD, 0xFF, 0xEF, 0x04, 0x03, 0x02, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn rpdo_receives_and_notifies_callback() {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let od = Arc::new(sample_od());
        let rpdo = Arc::new(Rpdo::new(network.clone(), od.clone(), CanId::std(0x204)));
        rpdo.set_mappings(sample_mappings()).unwrap();
        let received = Arc::new(StdMutex::new(false));
        let received_clone = received.clone();
        rpdo.add_callback(move |_| {
            *received_clone.lock().unwrap() = true;
        });
        rpdo.subscribe();

        network.notify(CanMessage::new(CanId::std(0x204), &[0xFD, 0xFF, 0xEF, 0x04, 0x03, 0x02, 0x01, 0x02]));

        assert!(*received.lock().unwrap());
        assert_eq!(od.variable(0x6000, 4).unwrap().value(), Value::Int(0x01020304));
    }
}
