//! CAN frame and standard CANopen message definitions

use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// A CAN frame identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A single CAN frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanMessage {
    /// The data payload of the message.
    ///
    /// Some bytes may be unused; check `dlc`.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
    /// Receive timestamp, in seconds, if known. Zero for outbound frames.
    pub timestamp: f64,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
            timestamp: 0.0,
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        assert!(
            dlc as usize <= MAX_DATA_LENGTH,
            "Data length exceeds maximum size of {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
            timestamp: 0.0,
        }
    }

    /// Create a new RTR message, which carries no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// Error codes reported in a CAN error frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[repr(u8)]
pub enum CanError {
    /// Bit error detected during arbitration or transmission
    Bit = 1,
    /// Bit-stuffing violation detected
    Stuff = 2,
    /// Malformed frame (e.g. bad SOF)
    Form = 3,
    /// Transmitter received no ACK
    Ack = 4,
    /// CRC mismatch
    Crc = 5,
    /// Any other error condition without a defined meaning here
    Other,
}

impl CanError {
    /// Create a CanError from the on-bus error code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Bit,
            2 => Self::Stuff,
            3 => Self::Form,
            4 => Self::Ack,
            5 => Self::Crc,
            _ => Self::Other,
        }
    }
}

/// NMT state transition command specifier, sent at COB-ID 0x000
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition to the Operational state
    Start = 1,
    /// Transition to the Stopped state
    Stop = 2,
    /// Transition to the Pre-Operational state
    EnterPreOp = 128,
    /// Perform an application reset
    ResetApp = 129,
    /// Perform a communication reset
    ResetComm = 130,
    /// Transition to the Sleep state
    Sleep = 80,
    /// Transition to the Standby state
    Standby = 96,
}

impl NmtCommandSpecifier {
    /// Parse the command specifier byte transmitted in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            80 => Ok(Self::Sleep),
            96 => Ok(Self::Standby),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The COB-ID used for sending NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0x000);
/// The COB-ID used for SYNC messages
pub const SYNC_ID: CanId = CanId::Std(0x080);
/// The COB-ID used for TIME messages
pub const TIME_ID: CanId = CanId::Std(0x100);
/// The base COB-ID for EMCY messages (node id is added)
pub const EMCY_BASE: u16 = 0x080;
/// The base COB-ID for heartbeat messages (node id is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The base COB-ID for SDO requests, client -> server (server node id is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The base COB-ID for SDO responses, server -> client (server node id is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// The base COB-IDs for the four predefined TPDOs (node id is added)
pub const TPDO_BASE: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// The base COB-IDs for the four predefined RPDOs (node id is added)
pub const RPDO_BASE: [u16; 4] = [0x200, 0x300, 0x400, 0x500];

/// An NMT command message
#[derive(Clone, Copy, Debug)]
pub struct NmtCommand {
    /// The requested command
    pub cs: NmtCommandSpecifier,
    /// Target node id, or 0 for a broadcast command to every node
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs: cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// The logical NMT state of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Bootup. A node never remains here; it transitions to PreOperational automatically.
    Bootup = 0,
    /// Node has been stopped: only NMT and heartbeat are active
    Stopped = 4,
    /// Normal operation: SDO, PDO, NMT and heartbeat all active
    Operational = 5,
    /// Awaiting a command to enter Operational: SDO, NMT and heartbeat active, PDO inactive
    PreOperational = 127,
    /// Low-power sleep: only NMT is active
    Sleep = 80,
    /// Low-power standby: NMT and heartbeat are active
    Standby = 96,
}

impl std::fmt::Display for NmtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
            NmtState::Sleep => write!(f, "Sleep"),
            NmtState::Standby => write!(f, "Standby"),
        }
    }
}

/// An out-of-range byte was found where an NmtState was expected
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            x if x == Sleep as u8 => Ok(Sleep),
            x if x == Standby as u8 => Ok(Standby),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat message
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The node transmitting the heartbeat
    pub node: u8,
    /// The NMT state it is reporting
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        CanMessage::new(
            CanId::Std(HEARTBEAT_BASE | value.node as u16),
            &[value.state as u8],
        )
    }
}

/// A SYNC message. The optional counter byte starts at 1 and wraps after reaching its configured
/// overflow value.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncObject {
    /// Counter value, if the producer is configured for counter mode
    pub counter: Option<u8>,
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        match value.counter {
            Some(count) => CanMessage::new(SYNC_ID, &[count]),
            None => CanMessage::new(SYNC_ID, &[]),
        }
    }
}

/// An EMCY (emergency) message, at COB-ID `0x080 + node_id`
#[derive(Clone, Copy, Debug)]
pub struct EmcyMessage {
    /// The emergency error code
    pub error_code: u16,
    /// The error register (OD 0x1001) value at the time of the event
    pub error_register: u8,
    /// Manufacturer-specific additional error data
    pub vendor_data: [u8; 5],
}

impl EmcyMessage {
    /// True if this message clears previously active errors (error code low byte == 0)
    pub fn is_reset(&self) -> bool {
        self.error_code & 0xFF == 0
    }
}

impl TryFrom<&[u8]> for EmcyMessage {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let error_code = u16::from_le_bytes([value[0], value[1]]);
        let error_register = value[2];
        let vendor_data = value[3..8].try_into().unwrap();
        Ok(EmcyMessage {
            error_code,
            error_register,
            vendor_data,
        })
    }
}

impl From<EmcyMessage> for [u8; 8] {
    fn from(value: EmcyMessage) -> Self {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&value.error_code.to_le_bytes());
        buf[2] = value.error_register;
        buf[3..8].copy_from_slice(&value.vendor_data);
        buf
    }
}

/// A TIME message, at COB-ID 0x100
#[derive(Clone, Copy, Debug)]
pub struct TimeOfDay {
    /// Milliseconds since midnight (28 bits significant)
    pub ms_since_midnight: u32,
    /// Days since 1970-01-01 (the Unix epoch)
    pub days: u16,
}

impl From<TimeOfDay> for [u8; 6] {
    fn from(value: TimeOfDay) -> Self {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&(value.ms_since_midnight & 0x0FFF_FFFF).to_le_bytes());
        buf[4..6].copy_from_slice(&value.days.to_le_bytes());
        buf
    }
}

impl TryFrom<&[u8]> for TimeOfDay {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 6 {
            return Err(MessageError::MessageTooShort);
        }
        let ms_since_midnight =
            u32::from_le_bytes([value[0], value[1], value[2], value[3]]) & 0x0FFF_FFFF;
        let days = u16::from_le_bytes([value[4], value[5]]);
        Ok(TimeOfDay {
            ms_since_midnight,
            days,
        })
    }
}

/// A parsed standard CANopen message, classified by its CAN-ID
#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub enum CanOpenMessage {
    NmtCommand(NmtCommand),
    Sync(SyncObject),
    Time(TimeOfDay),
    Heartbeat(Heartbeat),
    Emcy { node: u8, msg: EmcyMessage },
    SdoRequest { node: u8, req: SdoRequest },
    SdoResponse { node: u8, resp: SdoResponse },
}

impl TryFrom<CanMessage> for CanOpenMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let raw = cob_id.raw();

        if cob_id == NMT_CMD_ID {
            Ok(CanOpenMessage::NmtCommand(msg.try_into()?))
        } else if cob_id == SYNC_ID {
            Ok(CanOpenMessage::Sync(SyncObject {
                counter: msg.data().first().copied(),
            }))
        } else if cob_id == TIME_ID {
            Ok(CanOpenMessage::Time(msg.data().try_into()?))
        } else if !cob_id.is_extended() && raw & !0x7F == HEARTBEAT_BASE as u32 {
            let node = (raw & 0x7F) as u8;
            let state: NmtState = msg
                .data()
                .first()
                .copied()
                .unwrap_or(0)
                .try_into()
                .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(CanOpenMessage::Heartbeat(Heartbeat { node, state }))
        } else if !cob_id.is_extended() && raw & !0x7F == EMCY_BASE as u32 {
            let node = (raw & 0x7F) as u8;
            Ok(CanOpenMessage::Emcy {
                node,
                msg: msg.data().try_into()?,
            })
        } else if !cob_id.is_extended() && raw & !0x7F == SDO_RESP_BASE as u32 {
            let node = (raw & 0x7F) as u8;
            let resp: SdoResponse = msg
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanOpenMessage::SdoResponse { node, resp })
        } else if !cob_id.is_extended() && raw & !0x7F == SDO_REQ_BASE as u32 {
            let node = (raw & 0x7F) as u8;
            let req: SdoRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanOpenMessage::SdoRequest { node, req })
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Error converting a raw CanMessage to a parsed CANopen message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some other way
    MalformedMsg {
        /// COB-ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID didn't match the expected value
    #[snafu(display("unexpected message id {cob_id:?}, expected {expected:?}"))]
    UnexpectedId {
        /// Received id
        cob_id: CanId,
        /// Expected id
        expected: CanId,
    },
    /// A field held a value outside its allowed range
    InvalidField,
    /// COB-ID did not correspond to any known CANopen message type.
    ///
    /// Not unusual; the bus carries plenty of traffic (PDOs) this type doesn't classify.
    UnrecognizedId {
        /// The unrecognized id
        cob_id: CanId,
    },
    /// Byte found where an NmtState was expected is not a valid state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
}
