//! Wire format and message types shared by the gatehouse crates.

pub mod frame;
pub mod ids;
pub mod legacy;
pub mod message;
pub mod response;

pub use frame::{FrameError, HEADER_SIZE, MessageHeader, NetworkMessage, is_complete_message, parse_message};
pub use message::{GenericMessage, LoginMessage, Message, MessageMeta, MessageType, RegisterMessage};
pub use response::{OperationResult, ResponseType};
