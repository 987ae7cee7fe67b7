pub mod core;
pub mod message;
pub mod telopt;

pub use self::core::core_package;
pub use message::{GmcpMessage, Message, MessageBody, MessageData, MessageFactory, Package, UnknownMessage};
pub use telopt::{render_subnegotiation, Gmcp};
