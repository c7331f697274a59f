//! SDO wire protocol: request/response framing, abort codes and block-transfer segments.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// Server command specifier values (byte 0, bits 5..7) found in SDO response frames
enum ServerCommand {
    SegmentUpload = 0,
    SegmentDownload = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
    BlockDownload = 5,
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// SDO abort code
///
/// The reason an SDO transfer was aborted, carried as a 32-bit value in the final 4 bytes of an
/// abort frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write-only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read-only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to a PDO
    UnnallowedPdo = 0x0604_0041,
    /// The number and length of mapped objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type mismatch, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type mismatch, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type mismatch, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for download parameter
    InvalidValue = 0x0609_0030,
    /// Value of download parameter too high
    ValueTooHigh = 0x0609_0031,
    /// Value of download parameter too low
    ValueTooLow = 0x0609_0032,
    /// Resource is not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored due to local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored due to the current device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl std::fmt::Display for AbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, *self as u32)
    }
}

impl std::error::Error for AbortCode {}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    ReqUploadSegment = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// A single segment of a block transfer
#[derive(Clone, Copy, Debug)]
pub struct BlockSegment {
    /// True if this is the last segment of the block transfer
    pub c: bool,
    /// Sequence number, 1..=127, incrementing within a block
    pub seqnum: u8,
    /// Payload bytes of this segment
    pub data: [u8; 7],
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(());
        }
        let c = (value[0] & (1 << 7)) != 0;
        let seqnum = value[0] & 0x7f;
        let data: [u8; 7] = value[1..8].try_into().unwrap();
        Ok(Self { c, seqnum, data })
    }
}

impl BlockSegment {
    /// Convert to the 8-byte CAN payload
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = (self.c as u8) << 7 | self.seqnum & 0x7f;
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }

    /// Wrap into a CanMessage for transmission
    pub fn to_can_message(&self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadClientSubcommand {
    InitiateDownload = 0,
    EndDownload = 1,
}

impl TryFrom<u8> for BlockDownloadClientSubcommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateDownload),
            1 => Ok(Self::EndDownload),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadServerSubcommand {
    InitiateDownloadAck = 0,
    EndDownloadAck = 1,
    ConfirmBlock = 2,
}

impl TryFrom<u8> for BlockDownloadServerSubcommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateDownloadAck),
            1 => Ok(Self::EndDownloadAck),
            2 => Ok(Self::ConfirmBlock),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockUploadClientSubcommand {
    InitiateUpload = 0,
    EndUpload = 1,
    ConfirmBlock = 2,
    StartUpload = 3,
}

impl TryFrom<u8> for BlockUploadClientSubcommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateUpload),
            1 => Ok(Self::EndUpload),
            2 => Ok(Self::ConfirmBlock),
            3 => Ok(Self::StartUpload),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockUploadServerSubcommand {
    InitiateUpload = 0,
    EndUpload = 1,
}

impl TryFrom<u8> for BlockUploadServerSubcommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateUpload),
            1 => Ok(Self::EndUpload),
            _ => Err(()),
        }
    }
}

/// A request message, client to server
#[derive(Clone, Copy, Debug)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in `data` (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value (if e=1) or total size (if e=0, s=1)
        data: [u8; 4],
    },
    /// A segment of data sent to the server during a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// Requested object index
        index: u16,
        /// Requested sub-index
        sub: u8,
    },
    /// Request the next segment of an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Initiate a block download
    InitiateBlockDownload {
        /// Client supports CRC checking
        cc: bool,
        /// Size-valid flag
        s: bool,
        /// Target object index
        index: u16,
        /// Target sub-index
        sub: u8,
        /// Total size to download, valid if s=1
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// Number of bytes in the last segment of the last block without valid data
        n: u8,
        /// CRC-XMODEM of the full downloaded payload
        crc: u16,
    },
    /// Initiate a block upload
    InitiateBlockUpload {
        /// Object index to upload
        index: u16,
        /// Sub-index to upload
        sub: u8,
        /// Number of segments requested per block
        blksize: u8,
        /// Protocol switch threshold: if nonzero and size <= pst, server may use a simpler mode
        pst: u8,
    },
    /// End a block upload
    EndBlockUpload,
    /// Request the server to start sending the next upload block
    StartBlockUpload,
    /// Acknowledge receipt of a block during a block upload
    ConfirmBlock {
        /// Sequence number of the last segment successfully received
        ackseq: u8,
        /// Segment count to use for the next block
        blksize: u8,
    },
    /// Abort an ongoing transaction
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub-index of the active transfer
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code.int_value(),
        }
    }

    /// Create an initiate-download request (segmented, size known or unknown)
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create an expedited download request
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(data.len() <= 4);
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate-block-download request. The client always advertises CRC support.
    pub fn initiate_block_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: true,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end-block-download request
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create a download-segment request
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        assert!(segment_data.len() <= 7);
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an initiate-upload request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload-segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate-block-upload request. The client always advertises CRC support.
    pub fn initiate_block_upload(index: u16, sub: u8, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Convert the request to its 8-byte CAN payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | (n << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = ((ClientCommand::ReqUploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((cc as u8) << 2)
                    | ((s as u8) << 1)
                    | BlockDownloadClientSubcommand::InitiateDownload as u8;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | (n << 2)
                    | BlockDownloadClientSubcommand::EndDownload as u8;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | (1 << 2) // cc: client always supports CRC
                    | BlockUploadClientSubcommand::InitiateUpload as u8;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] =
                    ((ClientCommand::BlockUpload as u8) << 5) | BlockUploadClientSubcommand::EndUpload as u8;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | BlockUploadClientSubcommand::StartUpload as u8;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | BlockUploadClientSubcommand::ConfirmBlock as u8;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
        }
        payload
    }

    /// Convert the request to a CanMessage addressed to the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs = value[0] >> 5;
        let ccs: ClientCommand = ccs
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockUpload => {
                let csc = value[0] & 3;
                let subcommand = BlockUploadClientSubcommand::try_from(csc)
                    .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
                match subcommand {
                    BlockUploadClientSubcommand::InitiateUpload => {
                        let index = value[1] as u16 | ((value[2] as u16) << 8);
                        let sub = value[3];
                        let blksize = value[4];
                        let pst = value[5];
                        Ok(SdoRequest::InitiateBlockUpload {
                            index,
                            sub,
                            blksize,
                            pst,
                        })
                    }
                    BlockUploadClientSubcommand::EndUpload => Ok(SdoRequest::EndBlockUpload),
                    BlockUploadClientSubcommand::ConfirmBlock => {
                        let ackseq = value[1];
                        let blksize = value[2];
                        Ok(SdoRequest::ConfirmBlock { ackseq, blksize })
                    }
                    BlockUploadClientSubcommand::StartUpload => Ok(SdoRequest::StartBlockUpload),
                }
            }
            ClientCommand::BlockDownload => {
                let csc = value[0] & 0x1;
                let subcommand = BlockDownloadClientSubcommand::try_from(csc)
                    .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
                match subcommand {
                    BlockDownloadClientSubcommand::InitiateDownload => {
                        let cc = (value[0] & (1 << 2)) != 0;
                        let s = (value[0] & (1 << 1)) != 0;
                        let index = value[1] as u16 | ((value[2] as u16) << 8);
                        let sub = value[3];
                        let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                        Ok(SdoRequest::InitiateBlockDownload {
                            cc,
                            s,
                            index,
                            sub,
                            size,
                        })
                    }
                    BlockDownloadClientSubcommand::EndDownload => {
                        let n = (value[0] >> 2) & 7;
                        let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                        Ok(SdoRequest::EndBlockDownload { n, crc })
                    }
                }
            }
        }
    }
}

/// A response message, server to client
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Response to [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in `data` (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-valid flag
        s: bool,
        /// Object index being uploaded
        index: u16,
        /// Sub-index being uploaded
        sub: u8,
        /// Value (if e=1) or total size (if e=0, s=1)
        data: [u8; 4],
    },
    /// A segment of data sent during a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Response to [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// Object index written to
        index: u16,
        /// Sub-index written to
        sub: u8,
    },
    /// Response to [`SdoRequest::DownloadSegment`]
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Confirm a block-download initiation
    ConfirmBlockDownload {
        /// Server supports CRC checking
        sc: bool,
        /// Object index being downloaded
        index: u16,
        /// Sub-index being downloaded
        sub: u8,
        /// Segment count to use for the next block
        blksize: u8,
    },
    /// Confirm completion of a block during a block download
    ConfirmBlock {
        /// Sequence number of the last segment successfully received
        ackseq: u8,
        /// Segment count to use for the next block
        blksize: u8,
    },
    /// Confirm completion of a block download
    ConfirmBlockDownloadEnd,
    /// Confirm a block-upload initiation
    ConfirmBlockUpload {
        /// Server supports CRC checking
        sc: bool,
        /// Size-valid flag
        s: bool,
        /// Object index being uploaded
        index: u16,
        /// Sub-index being uploaded
        sub: u8,
        /// Total size, valid if s=1
        size: u32,
    },
    /// Sent by the server to end a block upload
    BlockUploadEnd {
        /// Number of bytes in the last segment of the last block without valid data
        n: u8,
        /// CRC-XMODEM of the full uploaded payload (valid only if both ends negotiated CRC)
        crc: u16,
    },
    /// Abort an ongoing transaction
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub-index of the active transfer
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.dlc < 8 {
            return Err(());
        }
        let scs = msg.data[0] >> 5;
        let command: ServerCommand = scs.try_into()?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                let n = (msg.data[0] >> 1) & 7;
                let c = (msg.data[0] & 1) != 0;
                let data: [u8; 7] = msg.data[1..8].try_into().unwrap();
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (msg.data[0] >> 2) & 0x3;
                let e = (msg.data[0] & (1 << 1)) != 0;
                let s = (msg.data[0] & 1) != 0;
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let data: [u8; 4] = msg.data[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::BlockDownload => {
                match BlockDownloadServerSubcommand::try_from(msg.data[0] & 0x3)? {
                    BlockDownloadServerSubcommand::ConfirmBlock => {
                        let ackseq = msg.data[1];
                        let blksize = msg.data[2];
                        Ok(SdoResponse::ConfirmBlock { ackseq, blksize })
                    }
                    BlockDownloadServerSubcommand::InitiateDownloadAck => {
                        let sc = (msg.data[0] & (1 << 2)) != 0;
                        let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                        let sub = msg.data[3];
                        let blksize = msg.data[4];
                        Ok(SdoResponse::ConfirmBlockDownload {
                            sc,
                            index,
                            sub,
                            blksize,
                        })
                    }
                    BlockDownloadServerSubcommand::EndDownloadAck => {
                        Ok(SdoResponse::ConfirmBlockDownloadEnd)
                    }
                }
            }
            ServerCommand::BlockUpload => {
                match BlockUploadServerSubcommand::try_from(msg.data[0] & 0x3)? {
                    BlockUploadServerSubcommand::InitiateUpload => {
                        let s = (msg.data[0] & (1 << 1)) != 0;
                        let sc = (msg.data[0] & (1 << 2)) != 0;
                        let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                        let sub = msg.data[3];
                        let size = u32::from_le_bytes(msg.data[4..8].try_into().unwrap());
                        Ok(SdoResponse::ConfirmBlockUpload {
                            sc,
                            s,
                            index,
                            sub,
                            size,
                        })
                    }
                    BlockUploadServerSubcommand::EndUpload => {
                        let n = (msg.data[0] >> 2) & 7;
                        let crc = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                        Ok(SdoResponse::BlockUploadEnd { n, crc })
                    }
                }
            }
            ServerCommand::Abort => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let abort_code = u32::from_le_bytes(msg.data[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

impl SdoResponse {
    /// Create a `ConfirmUpload` response for an expedited upload
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        assert!(data.len() <= 4, "expedited upload limited to 4 bytes");
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        // An empty upload clears the size bit rather than claiming a zero-length expedited value.
        let (s, n) = if data.is_empty() {
            (false, 0)
        } else {
            (true, 4 - data.len() as u8)
        };
        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s,
            n,
            data: msg_data,
        }
    }

    /// Create a `ConfirmUpload` response that begins a segmented upload
    pub fn upload_acknowledge(index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an `UploadSegment` response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        assert!(data.len() <= 7);
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a `ConfirmDownload` response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a `ConfirmDownloadSegment` response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a `ConfirmBlockDownload` response. Server always advertises CRC support.
    pub fn block_download_acknowledge(index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc: true,
            index,
            sub,
            blksize,
        }
    }

    /// Create a `ConfirmBlock` response, acknowledging receipt of a download block
    pub fn confirm_block(ackseq: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlock { ackseq, blksize }
    }

    /// Create a `ConfirmBlockUpload` response, initiating a block upload
    pub fn block_upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc: true,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create a `BlockUploadEnd` response
    pub fn block_upload_end(n: u8, crc: u16) -> SdoResponse {
        SdoResponse::BlockUploadEnd { n, crc }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code.int_value(),
        }
    }

    /// Convert the response to its 8-byte CAN payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::SegmentUpload as u8) << 5)
                    | ((t as u8) << 4)
                    | (n << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | ((sc as u8) << 2)
                    | (BlockDownloadServerSubcommand::InitiateDownloadAck as u8);
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | (BlockDownloadServerSubcommand::ConfirmBlock as u8);
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | (BlockDownloadServerSubcommand::EndDownloadAck as u8);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = ((ServerCommand::SegmentDownload as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((sc as u8) << 2)
                    | ((s as u8) << 1)
                    | BlockUploadServerSubcommand::InitiateUpload as u8;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((n & 7) << 2)
                    | BlockUploadServerSubcommand::EndUpload as u8;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the response to a CanMessage addressed to the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_upload_vector() {
        // 0x1018:01 = 4, per the scenario "Expedited upload of 0x1018:01 = 4"
        let req = SdoRequest::initiate_upload(0x1018, 1);
        assert_eq!(req.to_bytes(), [0x40, 0x18, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00]);

        let resp = SdoResponse::expedited_upload(0x1018, 1, &4u32.to_le_bytes());
        assert_eq!(resp.to_bytes(), [0x43, 0x18, 0x10, 0x01, 0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn expedited_download_vector() {
        let req = SdoRequest::expedited_download(0x1017, 0, &4000u32.to_le_bytes());
        assert_eq!(req.to_bytes(), [0x2B, 0x17, 0x10, 0x00, 0xA0, 0x0F, 0x00, 0x00]);

        let resp = SdoResponse::download_acknowledge(0x1017, 0);
        assert_eq!(resp.to_bytes(), [0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn abort_vector() {
        let resp = SdoResponse::abort(0x1018, 1, AbortCode::NoSuchSubIndex);
        assert_eq!(resp.to_bytes(), [0x80, 0x18, 0x10, 0x01, 0x11, 0x00, 0x09, 0x06]);
    }

    #[test]
    fn block_upload_request_roundtrip() {
        let req = SdoRequest::initiate_block_upload(0x1008, 0, 4, 0);
        let bytes = req.to_bytes();
        let parsed = SdoRequest::try_from(&bytes[..]).unwrap();
        match parsed {
            SdoRequest::InitiateBlockUpload {
                index,
                sub,
                blksize,
                pst,
            } => {
                assert_eq!(index, 0x1008);
                assert_eq!(sub, 0);
                assert_eq!(blksize, 4);
                assert_eq!(pst, 0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn block_upload_end_response_roundtrip() {
        let resp = SdoResponse::block_upload_end(3, 0xBEEF);
        let msg = resp.to_can_message(CanId::std(0x582));
        let parsed = SdoResponse::try_from(msg).unwrap();
        assert_eq!(parsed, SdoResponse::BlockUploadEnd { n: 3, crc: 0xBEEF });
    }
}
