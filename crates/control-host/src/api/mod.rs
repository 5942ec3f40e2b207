//! Request/response protocol on `api.sock` shared by the server and `vt`.

pub mod client;
pub mod forward;
pub mod protocol;
pub mod server;

pub use client::{ClientError, SocketApiClient};
pub use forward::{GitEventForwarder, HttpForwarder};
pub use protocol::{ApiFrame, ApiMessage, ApiParser, MessageType};
pub use server::ApiSocketServer;
