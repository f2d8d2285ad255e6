//! A windowed TFTP server core: RFC 1350 transfers with RFC 2347/2348/2349
//! option negotiation and RFC 7440 windowed sends, driven by a single
//! cooperative listener task.

pub mod options;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;

pub use server::{Server, ServerConfig, ServerEvent, TransferInfo};
pub use session::TransferKind;
