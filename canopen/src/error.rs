//! The crate-wide error taxonomy described in the error handling design: every subsystem's
//! local error type is either used directly or converted into [`Error`] at the `Node`-level API.

use snafu::Snafu;

use canopen_common::sdo::AbortCode;
use canopen_common::OdError;

use crate::network::NetworkError;
use crate::sdo_client::SdoClientError;

/// A top-level error raised by any node-facing operation
#[derive(Debug, Snafu)]
pub enum Error {
    /// An SDO abort code was received or sent
    #[snafu(display("SDO transfer aborted: {code}"))]
    ProtocolAbort {
        /// The abort reason
        code: AbortCode,
    },
    /// A request timed out or the response was malformed
    #[snafu(display("SDO communication failure: {source}"))]
    CommunicationFailure {
        /// Underlying client error
        source: SdoClientError,
    },
    /// The Object Dictionary rejected the access
    #[snafu(display("OD access error: {source}"))]
    AccessViolation {
        /// Underlying lookup/access failure
        source: OdError,
    },
    /// An SDO client already has a transfer in flight
    Busy,
    /// The underlying CAN transport failed to accept a frame
    #[snafu(display("transport error: {source}"))]
    Transport {
        /// Underlying network failure
        source: NetworkError,
    },
    /// An argument violated a configuration invariant (e.g. PDO mapping > 64 bits)
    #[snafu(display("invalid configuration: {reason}"))]
    Configuration {
        /// Description of the violated invariant
        reason: String,
    },
}

impl From<SdoClientError> for Error {
    fn from(source: SdoClientError) -> Self {
        match source {
            SdoClientError::ProtocolAbort { code } => Error::ProtocolAbort { code },
            SdoClientError::Busy => Error::Busy,
            other => Error::CommunicationFailure { source: other },
        }
    }
}

impl From<OdError> for Error {
    fn from(source: OdError) -> Self {
        Error::AccessViolation { source }
    }
}

impl From<NetworkError> for Error {
    fn from(source: NetworkError) -> Self {
        Error::Transport { source }
    }
}
