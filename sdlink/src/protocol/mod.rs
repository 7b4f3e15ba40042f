//! Device protocol: framing, command codes and the session state machine.

pub mod command;
pub mod frame;
pub mod session;

pub use command::{Command, ServiceCommand};
pub use frame::{ResponseScanner, encode_request, encode_response};
pub use session::{Mode, Session, SessionConfig};
