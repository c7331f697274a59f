//! SDO client: initiates uploads/downloads against a remote node's Object Dictionary.
//!
//! One client binds one `(tx_cobid, rx_cobid)` pair to a single remote node and holds at most one
//! in-flight transfer; a second caller attempting to start a transfer while one is active gets
//! [`SdoClientError::Busy`] rather than queuing behind it.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use canopen_common::messages::{CanId, CanMessage};
use canopen_common::node_id::NodeId;
use canopen_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use canopen_common::traits::AsyncCanSender;

use crate::network::Network;

/// Default bound on a single request/response round-trip
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);
/// Default number of retries after a timeout, before giving up
pub const DEFAULT_MAX_RETRIES: u8 = 2;
/// Default number of segments requested per block transfer
pub const DEFAULT_BLKSIZE: u8 = 4;

/// Failures raised by [`SdoClient`] operations
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum SdoClientError {
    /// The server responded with an abort frame
    #[snafu(display("SDO transfer aborted: {code}"))]
    ProtocolAbort {
        /// The decoded abort reason
        code: AbortCode,
    },
    /// No valid response arrived after all retries were exhausted
    NoResponse,
    /// A response frame arrived that didn't match the expected shape for the current state
    UnexpectedResponse,
    /// The server's segment toggle bit didn't alternate as expected
    ToggleNotAlternated,
    /// The block-transfer CRC did not match
    CrcMismatch,
    /// The server reduced the block size below what the in-flight retransmission needs
    BlockSizeChangedTooSmall,
    /// Another transfer is already in flight on this client
    Busy,
    /// The underlying CAN transport rejected a frame
    Transport,
}

fn protocol_abort(raw: u32) -> SdoClientError {
    use int_enum::IntEnum;
    SdoClientError::ProtocolAbort {
        code: AbortCode::from_int(raw).unwrap_or(AbortCode::GeneralError),
    }
}

/// Matches `$resp` against an expected response pattern. An `Abort` frame becomes
/// [`SdoClientError::ProtocolAbort`]; anything else unexpected becomes
/// [`SdoClientError::UnexpectedResponse`].
macro_rules! match_response {
    ($resp:expr, $pattern:pat => $body:expr) => {
        match $resp {
            $pattern => $body,
            SdoResponse::Abort { abort_code, .. } => return Err(protocol_abort(abort_code)),
            _ => return Err(SdoClientError::UnexpectedResponse),
        }
    };
}

struct Inner<S: AsyncCanSender + 'static> {
    network: Network<S>,
    req_cob_id: CanId,
    resp_cob_id: CanId,
    rx: AsyncMutex<mpsc::UnboundedReceiver<CanMessage>>,
    transfer_lock: Arc<AsyncMutex<()>>,
    response_timeout: Duration,
    max_retries: u8,
}

/// An SDO client targeting one remote node.
pub struct SdoClient<S: AsyncCanSender + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: AsyncCanSender + 'static> Clone for SdoClient<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: AsyncCanSender + 'static> SdoClient<S> {
    /// Create a client using the predefined connection-set COB-IDs for `node_id`
    /// (`0x600 + id` request, `0x580 + id` response).
    pub fn new(network: Network<S>, node_id: NodeId) -> Self {
        Self::with_cob_ids(
            network,
            CanId::std(canopen_common::messages::SDO_REQ_BASE + node_id.raw() as u16),
            CanId::std(canopen_common::messages::SDO_RESP_BASE + node_id.raw() as u16),
        )
    }

    /// Create a client using explicit request/response COB-IDs (for a node using a non-default
    /// SDO channel).
    pub fn with_cob_ids(network: Network<S>, req_cob_id: CanId, resp_cob_id: CanId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        network.subscribe(resp_cob_id, move |msg| {
            let _ = tx.send(msg);
        });
        Self {
            inner: Arc::new(Inner {
                network,
                req_cob_id,
                resp_cob_id,
                rx: AsyncMutex::new(rx),
                transfer_lock: Arc::new(AsyncMutex::new(())),
                response_timeout: DEFAULT_RESPONSE_TIMEOUT,
                max_retries: DEFAULT_MAX_RETRIES,
            }),
        }
    }

    /// Set the per-request response timeout and retry count
    pub fn with_timeout(mut self, timeout: Duration, max_retries: u8) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("client must be unshared to reconfigure");
        inner.response_timeout = timeout;
        inner.max_retries = max_retries;
        self
    }

    fn try_lock(&self) -> Result<tokio::sync::OwnedMutexGuard<()>, SdoClientError> {
        self.inner
            .transfer_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SdoClientError::Busy)
    }

    async fn send_request(&self, req: SdoRequest) -> Result<(), SdoClientError> {
        self.inner
            .network
            .send(self.inner.req_cob_id, &req.to_bytes())
            .await
            .map_err(|_| SdoClientError::Transport)
    }

    async fn send_raw(&self, bytes: &[u8; 8]) -> Result<(), SdoClientError> {
        self.inner
            .network
            .send(self.inner.req_cob_id, bytes)
            .await
            .map_err(|_| SdoClientError::Transport)
    }

    async fn recv_response(
        &self,
        rx: &mut mpsc::UnboundedReceiver<CanMessage>,
    ) -> Result<SdoResponse, SdoClientError> {
        let msg = tokio::time::timeout(self.inner.response_timeout, rx.recv())
            .await
            .map_err(|_| SdoClientError::NoResponse)?
            .ok_or(SdoClientError::Transport)?;
        SdoResponse::try_from(msg).map_err(|_| SdoClientError::UnexpectedResponse)
    }

    async fn recv_raw(
        &self,
        rx: &mut mpsc::UnboundedReceiver<CanMessage>,
    ) -> Result<CanMessage, SdoClientError> {
        tokio::time::timeout(self.inner.response_timeout, rx.recv())
            .await
            .map_err(|_| SdoClientError::NoResponse)?
            .ok_or(SdoClientError::Transport)
    }

    /// Send `req`, retrying up to `max_retries` times on timeout, and return the first parsed
    /// response.
    async fn request(
        &self,
        rx: &mut mpsc::UnboundedReceiver<CanMessage>,
        req: SdoRequest,
    ) -> Result<SdoResponse, SdoClientError> {
        let mut attempt = 0u8;
        loop {
            self.send_request(req).await?;
            match self.recv_response(rx).await {
                Ok(resp) => return Ok(resp),
                Err(SdoClientError::NoResponse) if attempt < self.inner.max_retries => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_abort(&self, index: u16, sub: u8, code: AbortCode) {
        let _ = self.send_request(SdoRequest::abort(index, sub, code)).await;
    }

    /// Write `data` to `index:sub`. Expedited if `data.len() <= 4`, segmented otherwise.
    pub async fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), SdoClientError> {
        let _guard = self.try_lock()?;
        let mut rx = self.inner.rx.lock().await;

        if data.len() <= 4 {
            let resp = self
                .request(&mut rx, SdoRequest::expedited_download(index, sub, data))
                .await?;
            match_response!(resp, SdoResponse::ConfirmDownload { .. } => Ok(()))
        } else {
            let resp = self
                .request(&mut rx, SdoRequest::initiate_download(index, sub, Some(data.len() as u32)))
                .await?;
            match_response!(resp, SdoResponse::ConfirmDownload { .. } => ());

            let mut toggle = false;
            let mut offset = 0;
            while offset < data.len() {
                let remaining = data.len() - offset;
                let chunk_len = remaining.min(7);
                let last = chunk_len == remaining;
                let resp = self
                    .request(
                        &mut rx,
                        SdoRequest::download_segment(toggle, last, &data[offset..offset + chunk_len]),
                    )
                    .await?;
                match_response!(resp, SdoResponse::ConfirmDownloadSegment { t } => {
                    if t != toggle {
                        self.send_abort(index, sub, AbortCode::ToggleNotAlternated).await;
                        return Err(SdoClientError::ToggleNotAlternated);
                    }
                });
                toggle = !toggle;
                offset += chunk_len;
            }
            Ok(())
        }
    }

    /// Read the value at `index:sub`. Returns the server's chosen transfer mode transparently.
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>, SdoClientError> {
        let _guard = self.try_lock()?;
        let mut rx = self.inner.rx.lock().await;

        let resp = self.request(&mut rx, SdoRequest::initiate_upload(index, sub)).await?;
        match resp {
            SdoResponse::ConfirmUpload { e: true, s, n, data, .. } => {
                let len = if s { 4 - n as usize } else { 4 };
                Ok(data[..len].to_vec())
            }
            SdoResponse::ConfirmUpload { e: false, data, .. } => {
                let total = u32::from_le_bytes(data) as usize;
                let mut buffer = Vec::with_capacity(total);
                let mut toggle = false;
                loop {
                    let resp = self
                        .request(&mut rx, SdoRequest::upload_segment_request(toggle))
                        .await?;
                    match_response!(resp, SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            self.send_abort(index, sub, AbortCode::ToggleNotAlternated).await;
                            return Err(SdoClientError::ToggleNotAlternated);
                        }
                        buffer.extend_from_slice(&data[..7 - n as usize]);
                        toggle = !toggle;
                        if c {
                            break;
                        }
                    });
                }
                Ok(buffer)
            }
            SdoResponse::Abort { abort_code, .. } => Err(protocol_abort(abort_code)),
            _ => Err(SdoClientError::UnexpectedResponse),
        }
    }

    /// Write `data` using block transfer, requesting `blksize` segments per acknowledgment round.
    pub async fn block_download(
        &self,
        index: u16,
        sub: u8,
        data: &[u8],
        blksize: u8,
    ) -> Result<(), SdoClientError> {
        let _guard = self.try_lock()?;
        let mut rx = self.inner.rx.lock().await;

        let resp = self
            .request(&mut rx, SdoRequest::initiate_block_download(index, sub, data.len() as u32))
            .await?;
        let mut blksize = match_response!(resp, SdoResponse::ConfirmBlockDownload { blksize, .. } => blksize);
        if blksize == 0 {
            blksize = DEFAULT_BLKSIZE;
        }

        let mut offset = 0usize;
        let mut last_n = 0u8;

        while offset < data.len() {
            let block_start = offset;
            let mut seqnum = 0u8;
            while seqnum < blksize && offset < data.len() {
                seqnum += 1;
                let remaining = data.len() - offset;
                let chunk_len = remaining.min(7);
                let mut payload = [0u8; 7];
                payload[..chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
                let is_final = offset + chunk_len == data.len();
                let segment = BlockSegment { c: is_final, seqnum, data: payload };
                self.send_raw(&segment.to_bytes()).await?;
                if is_final {
                    last_n = (7 - chunk_len) as u8;
                }
                offset += chunk_len;
            }

            let resp = self.recv_response(&mut rx).await?;
            let (ackseq, new_blksize) =
                match_response!(resp, SdoResponse::ConfirmBlock { ackseq, blksize } => (ackseq, blksize));
            if ackseq != seqnum {
                if new_blksize == 0 {
                    return Err(SdoClientError::BlockSizeChangedTooSmall);
                }
                offset = block_start + ackseq as usize * 7;
            }
            blksize = if new_blksize == 0 { blksize } else { new_blksize };
        }

        let crc = crc16::XMODEM::update(crc16::XMODEM::init(), data);
        let resp = self
            .request(&mut rx, SdoRequest::end_block_download(last_n, crc))
            .await?;
        match_response!(resp, SdoResponse::ConfirmBlockDownloadEnd => Ok(()))
    }

    /// Read the value at `index:sub` using block transfer.
    pub async fn block_upload(&self, index: u16, sub: u8, blksize: u8) -> Result<Vec<u8>, SdoClientError> {
        let _guard = self.try_lock()?;
        let mut rx = self.inner.rx.lock().await;

        let resp = self
            .request(&mut rx, SdoRequest::initiate_block_upload(index, sub, blksize, 0))
            .await?;
        let (size, mut blksize) = match resp {
            SdoResponse::ConfirmBlockUpload { size, .. } => (size as usize, blksize),
            SdoResponse::ConfirmUpload { e: true, s, n, data, .. } => {
                let len = if s { 4 - n as usize } else { 4 };
                return Ok(data[..len].to_vec());
            }
            SdoResponse::Abort { abort_code, .. } => return Err(protocol_abort(abort_code)),
            _ => return Err(SdoClientError::UnexpectedResponse),
        };

        self.send_request(SdoRequest::StartBlockUpload).await?;

        let mut buffer: Vec<u8> = Vec::with_capacity(size);
        let mut trailing_unused = 0u8;
        let mut done = false;

        while !done {
            let mut last_seqnum = 0u8;
            loop {
                let msg = self.recv_raw(&mut rx).await?;
                if let Ok(SdoResponse::Abort { abort_code, .. }) = SdoResponse::try_from(msg) {
                    return Err(protocol_abort(abort_code));
                }
                let segment = BlockSegment::try_from(msg.data()).map_err(|_| SdoClientError::UnexpectedResponse)?;
                buffer.extend_from_slice(&segment.data);
                last_seqnum = segment.seqnum;
                if segment.c {
                    done = true;
                    break;
                }
                if segment.seqnum >= blksize {
                    break;
                }
            }

            if done {
                let resp = self.recv_response(&mut rx).await?;
                match_response!(resp, SdoResponse::BlockUploadEnd { n, crc } => {
                    trailing_unused = n;
                    let data_len = buffer.len().saturating_sub(n as usize);
                    let payload = &buffer[..data_len];
                    let computed = crc16::XMODEM::update(crc16::XMODEM::init(), payload);
                    if computed != crc {
                        self.send_abort(index, sub, AbortCode::CrcError).await;
                        return Err(SdoClientError::CrcMismatch);
                    }
                });
                self.send_request(SdoRequest::EndBlockUpload).await?;
            } else {
                let ack = SdoRequest::ConfirmBlock { ackseq: last_seqnum, blksize };
                self.send_raw(&ack.to_bytes()).await?;
            }
        }

        let _ = trailing_unused;
        let data_len = buffer.len().saturating_sub(trailing_unused as usize).min(size.max(buffer.len()));
        buffer.truncate(data_len);
        Ok(buffer)
    }

    /// Convenience: write a little-endian `u32`
    pub async fn download_u32(&self, index: u16, sub: u8, value: u32) -> Result<(), SdoClientError> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Convenience: write a little-endian `u16`
    pub async fn download_u16(&self, index: u16, sub: u8, value: u16) -> Result<(), SdoClientError> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Convenience: write a `u8`
    pub async fn download_u8(&self, index: u16, sub: u8, value: u8) -> Result<(), SdoClientError> {
        self.download(index, sub, &[value]).await
    }

    /// Convenience: read a little-endian `u32`
    pub async fn upload_u32(&self, index: u16, sub: u8) -> Result<u32, SdoClientError> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; 4] = data.get(..4).ok_or(SdoClientError::UnexpectedResponse)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    /// Convenience: read a little-endian `u16`
    pub async fn upload_u16(&self, index: u16, sub: u8) -> Result<u16, SdoClientError> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; 2] = data.get(..2).ok_or(SdoClientError::UnexpectedResponse)?.try_into().unwrap();
        Ok(u16::from_le_bytes(bytes))
    }

    /// Convenience: read a `u8`
    pub async fn upload_u8(&self, index: u16, sub: u8) -> Result<u8, SdoClientError> {
        let data = self.upload(index, sub).await?;
        data.first().copied().ok_or(SdoClientError::UnexpectedResponse)
    }

    /// Convenience: read a VISIBLE_STRING value
    pub async fn upload_visible_string(&self, index: u16, sub: u8) -> Result<String, SdoClientError> {
        let data = self.upload(index, sub).await?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    /// Read the device name object (0x1008)
    pub async fn read_device_name(&self) -> Result<String, SdoClientError> {
        self.upload_visible_string(0x1008, 0).await
    }

    /// Read the hardware version object (0x1009)
    pub async fn read_hardware_version(&self) -> Result<String, SdoClientError> {
        self.upload_visible_string(0x1009, 0).await
    }

    /// Read the software version object (0x100A)
    pub async fn read_software_version(&self) -> Result<String, SdoClientError> {
        self.upload_visible_string(0x100A, 0).await
    }
}

/// A file-like streaming facade over a segmented or block SDO transfer.
///
/// Buffers segment boundaries so callers can issue arbitrary-size reads; binary mode passes bytes
/// through unchanged, text mode decodes/encodes via a named encoding (only ASCII/UTF-8 supported).
pub mod stream {
    use super::*;

    /// Transfer encoding for a stream opened over an SDO channel
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Encoding {
        /// Raw bytes, no decoding
        Binary,
        /// ASCII/UTF-8 text
        Ascii,
    }

    /// Whether block transfer is requested when opening a stream
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Mode {
        /// Read from the remote object
        Read,
        /// Write to the remote object
        Write,
    }

    /// A readable stream over one SDO upload
    pub struct ReadableStream {
        data: std::io::Cursor<Vec<u8>>,
        encoding: Encoding,
    }

    impl ReadableStream {
        /// Open a read stream, performing the whole transfer up front and buffering it
        pub async fn open<S: AsyncCanSender + 'static>(
            client: &SdoClient<S>,
            index: u16,
            sub: u8,
            encoding: Encoding,
            block_transfer: bool,
        ) -> Result<Self, SdoClientError> {
            let data = if block_transfer {
                client.block_upload(index, sub, DEFAULT_BLKSIZE).await?
            } else {
                client.upload(index, sub).await?
            };
            Ok(Self { data: std::io::Cursor::new(data), encoding })
        }

        /// Read up to `buf.len()` bytes, returning the number of bytes read (0 at end of stream)
        pub fn read(&mut self, buf: &mut [u8]) -> usize {
            use std::io::Read;
            self.data.read(buf).unwrap_or(0)
        }

        /// Read the remainder as a `String`, decoding per the stream's encoding
        pub fn read_to_string(&mut self) -> Result<String, SdoClientError> {
            let mut buf = Vec::new();
            use std::io::Read;
            self.data.read_to_end(&mut buf).map_err(|_| SdoClientError::UnexpectedResponse)?;
            match self.encoding {
                Encoding::Binary => Ok(String::from_utf8_lossy(&buf).into_owned()),
                Encoding::Ascii => Ok(String::from_utf8_lossy(&buf).into_owned()),
            }
        }
    }

    /// A writable stream over one SDO download, finalized by [`WritableStream::close`]
    pub struct WritableStream<'a, S: AsyncCanSender + 'static> {
        client: &'a SdoClient<S>,
        index: u16,
        sub: u8,
        buffer: Vec<u8>,
        block_transfer: bool,
    }

    impl<'a, S: AsyncCanSender + 'static> WritableStream<'a, S> {
        /// Open a write stream; nothing is sent until [`close`](Self::close)
        pub fn open(client: &'a SdoClient<S>, index: u16, sub: u8, block_transfer: bool) -> Self {
            Self { client, index, sub, buffer: Vec::new(), block_transfer }
        }

        /// Buffer bytes for the eventual transfer
        pub fn write(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        /// Finalize the transfer, sending the buffered bytes
        pub async fn close(self) -> Result<(), SdoClientError> {
            if self.block_transfer {
                self.client.block_download(self.index, self.sub, &self.buffer, DEFAULT_BLKSIZE).await
            } else {
                self.client.download(self.index, self.sub, &self.buffer).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::codec::{DataType, Value};
    use canopen_common::node_id::NodeId;
    use canopen_common::object_dictionary::{AccessType, ObjectDictionary, Variable};
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

    fn node_with_od() -> (Network<LoopbackSender>, NodeId, Arc<ObjectDictionary>) {
        let (tx, _rx) = mpsc::channel();
        let network = Network::connect(LoopbackSender { tx }, NullReceiver);
        let mut od = ObjectDictionary::new();
        od.insert_variable(Variable::new(0x2000, 0, "counter", DataType::Unsigned32, AccessType::Rw, Value::Uint(0)));
        od.insert_variable(Variable::new(
            0x1008,
            0,
            "device_name",
            DataType::VisibleString,
            AccessType::Ro,
            Value::Str("zencanopen".to_string()),
        ));
        od.insert_variable(Variable::new(0x2001, 0, "blob", DataType::Domain, AccessType::Rw, Value::Bytes(Vec::new())));
        od.insert_variable(Variable::new(0x2002, 0, "command", DataType::Unsigned8, AccessType::Wo, Value::Uint(0)));
        (network, NodeId::new(9).unwrap(), Arc::new(od))
    }

    #[tokio::test]
    async fn expedited_download_and_upload_round_trip() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od.clone());
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        client.download_u32(0x2000, 0, 0xDEADBEEF).await.unwrap();
        let value = client.upload_u32(0x2000, 0).await.unwrap();
        assert_eq!(value, 0xDEADBEEF);
        assert_eq!(od.variable(0x2000, 0).unwrap().value(), Value::Uint(0xDEADBEEF));
    }

    #[tokio::test]
    async fn segmented_upload_of_a_string() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od);
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        let name = client.read_device_name().await.unwrap();
        assert_eq!(name, "zencanopen");
    }

    #[tokio::test]
    async fn write_to_unknown_object_aborts() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od);
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        let err = client.download_u8(0x3000, 0, 1).await.unwrap_err();
        assert!(matches!(err, SdoClientError::ProtocolAbort { code: AbortCode::NoSuchObject }));
    }

    #[tokio::test]
    async fn upload_of_write_only_object_aborts_with_write_only_code() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od);
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        let err = client.upload_u8(0x2002, 0).await.unwrap_err();
        assert!(matches!(err, SdoClientError::ProtocolAbort { code: AbortCode::WriteOnly }));
    }

    #[tokio::test]
    async fn download_of_read_only_object_aborts_with_read_only_code() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od);
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        let err = client.download_u8(0x1008, 0, 1).await.unwrap_err();
        assert!(matches!(err, SdoClientError::ProtocolAbort { code: AbortCode::ReadOnly }));
    }

    #[tokio::test]
    async fn block_download_and_upload_round_trip_large_payload() {
        let (network, node_id, od) = node_with_od();
        let server = crate::sdo_server::SdoServer::new(network.clone(), node_id, od.clone());
        let _server_task = server.spawn();
        let client = SdoClient::new(network, node_id);

        let payload: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        client.block_download(0x2001, 0, &payload, DEFAULT_BLKSIZE).await.unwrap();
        assert_eq!(od.variable(0x2001, 0).unwrap().encode_raw(), payload);

        let uploaded = client.block_upload(0x2001, 0, DEFAULT_BLKSIZE).await.unwrap();
        assert_eq!(uploaded, payload);
    }
}
