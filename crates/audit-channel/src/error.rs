use nix::errno::Errno;
use thiserror::Error;

use crate::MessageType;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("opening the audit socket requires CAP_AUDIT_CONTROL")]
    PermissionDenied(#[source] nix::Error),
    #[error("audit subsystem unavailable")]
    Unavailable(#[source] nix::Error),
    #[error("rule already installed")]
    DuplicateRule,
    #[error("kernel rejected the rule as invalid")]
    InvalidRule,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("rule not found")]
    RuleNotFound,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("audit socket i/o")]
    Transport(#[source] nix::Error),
    #[error("receive interrupted by stop signal")]
    Interrupted,
    #[error("no reply to {msg_type} request {seq}")]
    NoReply { msg_type: MessageType, seq: u32 },
    #[error("kernel returned {0}")]
    Kernel(Errno),
}

impl ChannelError {
    /// Map the errno of a `NLMSG_ERROR` reply.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match Errno::from_i32(errno) {
            Errno::EEXIST => ChannelError::DuplicateRule,
            Errno::ENOENT => ChannelError::RuleNotFound,
            Errno::EINVAL => ChannelError::InvalidRule,
            Errno::EPERM | Errno::EACCES => ChannelError::NotPermitted,
            other => ChannelError::Kernel(other),
        }
    }

    /// Errors after which the socket should be reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::PermissionDenied(_)
                | ChannelError::Unavailable(_)
                | ChannelError::Transport(_)
        )
    }
}
