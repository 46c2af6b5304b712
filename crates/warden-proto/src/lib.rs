pub mod commands;
pub mod framed;
pub mod message;

pub use commands::{
    CreateInstanceRequest, DeleteInstanceRequest, InstanceSummary, RegisterPayload, ServerTarget,
};
pub use framed::{FramedLink, LinkError};
pub use message::{Kind, Message, ProtocolError};
