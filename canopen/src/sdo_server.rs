//! SDO server: answers upload/download requests against a local [`ObjectDictionary`].
//!
//! One server owns one node's request/response COB-ID pair and processes transfers
//! sequentially: a block or segmented exchange runs to completion (or times out) before the
//! next request is accepted, mirroring the single-transfer-in-flight behavior of the client side.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use canopen_common::messages::{CanId, CanMessage};
use canopen_common::node_id::NodeId;
use canopen_common::object_dictionary::{AccessDirection, ObjectDictionary, OdError};
use canopen_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use canopen_common::traits::AsyncCanSender;

use crate::network::Network;

/// Segments offered per block transfer round. 127 is the protocol maximum.
const BLKSIZE: u8 = 127;
/// How long the server waits for the next segment/block request before aborting the transfer
const SDO_TIMEOUT: Duration = Duration::from_millis(300);

/// Invoked before a read is satisfied from the Object Dictionary. Returning `Some(bytes)`
/// overrides the stored value for this response only.
pub type ReadCallback = Arc<dyn Fn(u16, u8) -> Option<Vec<u8>> + Send + Sync>;
/// Invoked before a write is committed to the Object Dictionary. Returning `true` means the
/// callback fully handled the write and the server should not also store it.
pub type WriteCallback = Arc<dyn Fn(u16, u8, &[u8]) -> bool + Send + Sync>;

fn od_error_to_abort(err: OdError) -> AbortCode {
    match err {
        OdError::NoSuchObject { .. } => AbortCode::NoSuchObject,
        OdError::NoSuchSubIndex { .. } => AbortCode::NoSuchSubIndex,
        OdError::AccessViolation { direction: AccessDirection::Read, .. } => AbortCode::WriteOnly,
        OdError::AccessViolation { direction: AccessDirection::Write, .. } => AbortCode::ReadOnly,
        OdError::Codec { .. } => AbortCode::DataTypeMismatch,
    }
}

/// An SDO server bound to one node's Object Dictionary.
pub struct SdoServer<S: AsyncCanSender + 'static> {
    network: Network<S>,
    req_cob_id: CanId,
    resp_cob_id: CanId,
    od: Arc<ObjectDictionary>,
    read_callbacks: Vec<ReadCallback>,
    write_callbacks: Vec<WriteCallback>,
}

impl<S: AsyncCanSender + 'static> SdoServer<S> {
    /// Create a server for `node_id`, listening at `0x600 + id` and replying at `0x580 + id`
    pub fn new(network: Network<S>, node_id: NodeId, od: Arc<ObjectDictionary>) -> Self {
        Self {
            network,
            req_cob_id: CanId::std(canopen_common::messages::SDO_REQ_BASE + node_id.raw() as u16),
            resp_cob_id: CanId::std(canopen_common::messages::SDO_RESP_BASE + node_id.raw() as u16),
            od,
            read_callbacks: Vec::new(),
            write_callbacks: Vec::new(),
        }
    }

    /// Register a read-intercepting callback, run in registration order before the stored value
    pub fn add_read_callback(&mut self, callback: ReadCallback) {
        self.read_callbacks.push(callback);
    }

    /// Register a write-intercepting callback, run in registration order before the OD is updated
    pub fn add_write_callback(&mut self, callback: WriteCallback) {
        self.write_callbacks.push(callback);
    }

    /// Start serving requests on a background task. Dropping the returned handle does not stop
    /// the server; call [`JoinHandle::abort`] for that.
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.subscribe(self.req_cob_id, move |msg| {
            let _ = tx.send(msg);
        });

        let mut conn = Connection {
            network: self.network,
            resp_cob_id: self.resp_cob_id,
            od: self.od,
            read_callbacks: self.read_callbacks,
            write_callbacks: self.write_callbacks,
            rx,
        };

        tokio::spawn(async move { conn.serve().await })
    }
}

struct Connection<S: AsyncCanSender + 'static> {
    network: Network<S>,
    resp_cob_id: CanId,
    od: Arc<ObjectDictionary>,
    read_callbacks: Vec<ReadCallback>,
    write_callbacks: Vec<WriteCallback>,
    rx: mpsc::UnboundedReceiver<CanMessage>,
}

impl<S: AsyncCanSender + 'static> Connection<S> {
    async fn serve(&mut self) {
        loop {
            let Some(msg) = self.rx.recv().await else { return };
            let req = match SdoRequest::try_from(msg.data()) {
                Ok(req) => req,
                Err(abort_code) => {
                    self.reply(SdoResponse::abort(0, 0, abort_code)).await;
                    continue;
                }
            };
            self.dispatch(req).await;
        }
    }

    async fn reply(&self, resp: SdoResponse) {
        if self.network.send(self.resp_cob_id, &resp.to_bytes()).await.is_err() {
            log::warn!("SDO response send failed for {:?}", self.resp_cob_id);
        }
    }

    /// Receive the next request, aborting the in-progress transfer on timeout or disconnect.
    async fn next_request(&mut self, index: u16, sub: u8) -> Option<SdoRequest> {
        match tokio::time::timeout(SDO_TIMEOUT, self.rx.recv()).await {
            Ok(Some(msg)) => match SdoRequest::try_from(msg.data()) {
                Ok(req) => Some(req),
                Err(abort_code) => {
                    self.reply(SdoResponse::abort(index, sub, abort_code)).await;
                    None
                }
            },
            Ok(None) => None,
            Err(_) => {
                self.reply(SdoResponse::abort(index, sub, AbortCode::SdoTimeout)).await;
                None
            }
        }
    }

    /// Receive the next raw frame (used while reading block-transfer segments, which don't parse
    /// as a typed [`SdoRequest`]).
    async fn next_raw(&mut self, index: u16, sub: u8) -> Option<CanMessage> {
        match tokio::time::timeout(SDO_TIMEOUT, self.rx.recv()).await {
            Ok(Some(msg)) => Some(msg),
            Ok(None) => None,
            Err(_) => {
                self.reply(SdoResponse::abort(index, sub, AbortCode::SdoTimeout)).await;
                None
            }
        }
    }

    fn read_value(&self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        for cb in &self.read_callbacks {
            if let Some(data) = cb(index, sub) {
                return Ok(data);
            }
        }
        self.od.raw_read(index, sub).map_err(od_error_to_abort)
    }

    fn write_value(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        for cb in &self.write_callbacks {
            if cb(index, sub, data) {
                return Ok(());
            }
        }
        self.od.raw_write(index, sub, data).map_err(od_error_to_abort)
    }

    async fn dispatch(&mut self, req: SdoRequest) {
        match req {
            SdoRequest::Abort { .. } => {}

            SdoRequest::InitiateDownload { n, e, s, index, sub, data } => {
                if e {
                    let len = 4 - n as usize;
                    self.finish_download(index, sub, &data[..len]).await;
                } else {
                    self.reply(SdoResponse::download_acknowledge(index, sub)).await;
                    let expected = if s { u32::from_le_bytes(data) as usize } else { 0 };
                    self.run_download_segmented(index, sub, expected).await;
                }
            }

            SdoRequest::InitiateUpload { index, sub } => match self.read_value(index, sub) {
                Ok(data) if data.len() <= 4 => {
                    self.reply(SdoResponse::expedited_upload(index, sub, &data)).await;
                }
                Ok(data) => {
                    self.reply(SdoResponse::upload_acknowledge(index, sub, Some(data.len() as u32))).await;
                    self.run_upload_segmented(index, sub, data).await;
                }
                Err(code) => self.reply(SdoResponse::abort(index, sub, code)).await,
            },

            SdoRequest::InitiateBlockDownload { index, sub, .. } => {
                self.reply(SdoResponse::block_download_acknowledge(index, sub, BLKSIZE)).await;
                self.run_download_block(index, sub).await;
            }

            SdoRequest::InitiateBlockUpload { index, sub, blksize, .. } => match self.read_value(index, sub) {
                Ok(data) => {
                    self.reply(SdoResponse::block_upload_acknowledge(index, sub, data.len() as u32)).await;
                    self.run_upload_block(index, sub, data, blksize.max(1)).await;
                }
                Err(code) => self.reply(SdoResponse::abort(index, sub, code)).await,
            },

            // A segment/ack arriving with no transfer in progress; the client is out of sync.
            SdoRequest::DownloadSegment { .. }
            | SdoRequest::ReqUploadSegment { .. }
            | SdoRequest::EndBlockDownload { .. }
            | SdoRequest::StartBlockUpload
            | SdoRequest::ConfirmBlock { .. }
            | SdoRequest::EndBlockUpload => {
                self.reply(SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier)).await;
            }
        }
    }

    async fn finish_download(&self, index: u16, sub: u8, data: &[u8]) {
        match self.write_value(index, sub, data) {
            Ok(()) => self.reply(SdoResponse::download_acknowledge(index, sub)).await,
            Err(code) => self.reply(SdoResponse::abort(index, sub, code)).await,
        }
    }

    async fn run_download_segmented(&mut self, index: u16, sub: u8, expected: usize) {
        let mut buffer = Vec::with_capacity(expected);
        let mut toggle = false;
        loop {
            let Some(req) = self.next_request(index, sub).await else { return };
            match req {
                SdoRequest::DownloadSegment { t, n, c, data } => {
                    if t != toggle {
                        self.reply(SdoResponse::abort(index, sub, AbortCode::ToggleNotAlternated)).await;
                        return;
                    }
                    buffer.extend_from_slice(&data[..7 - n as usize]);
                    if c {
                        self.finish_download(index, sub, &buffer).await;
                        return;
                    }
                    self.reply(SdoResponse::download_segment_acknowledge(toggle)).await;
                    toggle = !toggle;
                }
                SdoRequest::Abort { .. } => return,
                _ => {
                    self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
                    return;
                }
            }
        }
    }

    async fn run_upload_segmented(&mut self, index: u16, sub: u8, mut remaining: Vec<u8>) {
        let mut toggle = false;
        loop {
            let Some(req) = self.next_request(index, sub).await else { return };
            match req {
                SdoRequest::ReqUploadSegment { t } => {
                    if t != toggle {
                        self.reply(SdoResponse::abort(index, sub, AbortCode::ToggleNotAlternated)).await;
                        return;
                    }
                    let chunk_len = remaining.len().min(7);
                    let chunk: Vec<u8> = remaining.drain(..chunk_len).collect();
                    let done = remaining.is_empty();
                    self.reply(SdoResponse::upload_segment(toggle, done, &chunk)).await;
                    if done {
                        return;
                    }
                    toggle = !toggle;
                }
                SdoRequest::Abort { .. } => return,
                _ => {
                    self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
                    return;
                }
            }
        }
    }

    async fn run_download_block(&mut self, index: u16, sub: u8) {
        let mut buffer: Vec<u8> = Vec::new();
        let blksize = BLKSIZE;

        loop {
            let mut seqnum = 0u8;
            let final_segment;
            loop {
                let Some(msg) = self.next_raw(index, sub).await else { return };
                let Ok(segment) = BlockSegment::try_from(msg.data()) else {
                    self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
                    return;
                };
                if segment.seqnum != seqnum + 1 {
                    // A gap in the sequence: ack what we actually have and let the client
                    // restart this block from there.
                    self.reply(SdoResponse::confirm_block(seqnum, blksize)).await;
                    continue;
                }
                seqnum = segment.seqnum;
                buffer.extend_from_slice(&segment.data);
                if segment.c {
                    final_segment = true;
                    break;
                }
                if seqnum >= blksize {
                    final_segment = false;
                    break;
                }
            }

            if final_segment {
                self.reply(SdoResponse::confirm_block(seqnum, blksize)).await;
                let Some(req) = self.next_request(index, sub).await else { return };
                let SdoRequest::EndBlockDownload { n, crc } = req else {
                    self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
                    return;
                };
                let data_len = buffer.len().saturating_sub(n as usize);
                let computed = crc16::XMODEM::update(crc16::XMODEM::init(), &buffer[..data_len]);
                if computed != crc {
                    self.reply(SdoResponse::abort(index, sub, AbortCode::CrcError)).await;
                    return;
                }
                match self.write_value(index, sub, &buffer[..data_len]) {
                    Ok(()) => self.reply(SdoResponse::ConfirmBlockDownloadEnd).await,
                    Err(code) => self.reply(SdoResponse::abort(index, sub, code)).await,
                }
                return;
            }

            self.reply(SdoResponse::confirm_block(seqnum, blksize)).await;
        }
    }

    async fn run_upload_block(&mut self, index: u16, sub: u8, data: Vec<u8>, requested_blksize: u8) {
        let Some(req) = self.next_request(index, sub).await else { return };
        if !matches!(req, SdoRequest::StartBlockUpload) {
            self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
            return;
        }

        let mut blksize = requested_blksize;
        let mut block_start = 0usize;

        loop {
            let offset_start = block_start;
            let mut offset = offset_start;
            let mut seqnum = 0u8;
            let mut last_n = 0u8;
            let mut final_segment = false;

            while seqnum < blksize && offset < data.len() {
                seqnum += 1;
                let remaining = data.len() - offset;
                let chunk_len = remaining.min(7);
                let mut payload = [0u8; 7];
                payload[..chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
                let is_final = offset + chunk_len == data.len();
                let segment = BlockSegment { c: is_final, seqnum, data: payload };
                if self.network.send(self.resp_cob_id, &segment.to_bytes()).await.is_err() {
                    log::warn!("block upload segment send failed for {:?}", self.resp_cob_id);
                    return;
                }
                offset += chunk_len;
                if is_final {
                    last_n = (7 - chunk_len) as u8;
                    final_segment = true;
                    break;
                }
            }

            if final_segment {
                let crc = crc16::XMODEM::update(crc16::XMODEM::init(), &data);
                self.reply(SdoResponse::block_upload_end(last_n, crc)).await;
                let Some(req) = self.next_request(index, sub).await else { return };
                if !matches!(req, SdoRequest::EndBlockUpload) {
                    log::warn!("expected EndBlockUpload, got {req:?}");
                }
                return;
            }

            let Some(req) = self.next_request(index, sub).await else { return };
            let SdoRequest::ConfirmBlock { ackseq, blksize: next_blksize } = req else {
                self.reply(SdoResponse::abort(index, sub, AbortCode::InvalidCommandSpecifier)).await;
                return;
            };
            if ackseq != seqnum {
                block_start += ackseq as usize * 7;
            } else {
                block_start = offset;
            }
            blksize = if next_blksize == 0 { blksize } else { next_blksize };
        }
    }
}
