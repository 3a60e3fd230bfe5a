//! Request/response RPC with callable references, over a framed channel.

pub mod channel;
pub mod codec;
pub mod protocol;
mod session;
pub mod transport;

pub use codec::Encoded;
pub use protocol::{Message, Target};
pub use session::{Remote, Session, SessionEvents};
pub use transport::{Frame, read_frame, read_message, spawn_writer, write_message};
