//! Shared runtime for the taskrelay agents: wire protocol, control link,
//! task scheduler and the small helpers both agents lean on.

pub mod conf;
pub mod link;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod scheduler;
pub mod verify;

pub use link::{Dispatch, Link, LinkConfig, Outbox};
pub use protocol::{Envelope, Inbound, MessageType, StreamEvent};
pub use scheduler::{AdmitError, Scheduler};
