//! Wire-level types shared by the CANopen master and local-server sides of the stack: CAN
//! frames, the SDO request/response codec, the Object Dictionary data model, and the typed
//! value codec underlying both.

pub mod codec;
pub mod messages;
pub mod node_id;
pub mod object_dictionary;
pub mod sdo;
pub mod traits;

pub use codec::{CodecError, DataType, Value};
pub use messages::{CanError, CanId, CanMessage, CanOpenMessage};
pub use node_id::NodeId;
pub use object_dictionary::{AccessType, Object, ObjectDictionary, OdError, Variable};
pub use sdo::{AbortCode, SdoRequest, SdoResponse};
