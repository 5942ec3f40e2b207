//! Control protocol spoken with the native Mac app over `control.sock`.

pub mod connection;
pub mod handlers;
pub mod message;
pub mod router;
pub mod server;

pub use connection::ConnectionManager;
pub use message::{Category, ControlMessage, ControlParser, MessageKind};
pub use router::{CategoryHandler, HandlerError, Router};
pub use server::{ControlConfig, ControlUnixHandler};
