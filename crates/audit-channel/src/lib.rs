//! Netlink channel to the Linux audit subsystem.
//!
//! An [`EventChannel`] installs and deletes [`audit_rule::AuditRule`]s and
//! decodes the record stream into [`DecodedEvent`]s. PATH and PROCTITLE
//! records are held back until the EOE marker closing their event arrives.

mod channel;
mod error;
pub mod event;
pub mod message;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use channel::{ChannelOptions, EventChannel, ReceiveMode, StopSignal};
pub use error::ChannelError;
pub use event::{DecodedEvent, EventAccumulator};
pub use message::{EventId, MessageType, ReplyMessage};
pub use status::AuditStatus;
pub use transport::{NetlinkTransport, Transport, Wait};
