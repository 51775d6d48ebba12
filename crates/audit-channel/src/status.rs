//! `struct audit_status`, exchanged by `AUDIT_GET` and `AUDIT_SET`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ChannelError;

/// Bits of [`AuditStatus::mask`] selecting which values an `AUDIT_SET` changes.
pub mod mask {
    pub const ENABLED: u32 = 0x0001;
    pub const FAILURE: u32 = 0x0002;
    pub const PID: u32 = 0x0004;
    pub const RATE_LIMIT: u32 = 0x0008;
    pub const BACKLOG_LIMIT: u32 = 0x0010;
}

const WORDS: usize = 11;
/// Kernels before 3.19 stop after `backlog`.
const MIN_WORDS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStatus {
    pub mask: u32,
    pub enabled: u32,
    pub failure: u32,
    pub pid: u32,
    pub rate_limit: u32,
    pub backlog_limit: u32,
    pub lost: u32,
    pub backlog: u32,
    pub feature_bitmap: u32,
    pub backlog_wait_time: u32,
    pub backlog_wait_time_actual: u32,
}

impl AuditStatus {
    pub fn enable(enabled: bool) -> Self {
        Self {
            mask: mask::ENABLED,
            enabled: enabled.into(),
            ..Default::default()
        }
    }

    pub fn listener(pid: u32) -> Self {
        Self {
            mask: mask::PID,
            pid,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(WORDS * 4);
        for word in [
            self.mask,
            self.enabled,
            self.failure,
            self.pid,
            self.rate_limit,
            self.backlog_limit,
            self.lost,
            self.backlog,
            self.feature_bitmap,
            self.backlog_wait_time,
            self.backlog_wait_time_actual,
        ] {
            out.put_u32_ne(word);
        }
        out.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ChannelError> {
        if data.len() < MIN_WORDS * 4 {
            return Err(ChannelError::MalformedMessage(format!(
                "audit status of {} bytes",
                data.len()
            )));
        }
        let mut next = || {
            if data.remaining() >= 4 {
                data.get_u32_ne()
            } else {
                0
            }
        };
        Ok(Self {
            mask: next(),
            enabled: next(),
            failure: next(),
            pid: next(),
            rate_limit: next(),
            backlog_limit: next(),
            lost: next(),
            backlog: next(),
            feature_bitmap: next(),
            backlog_wait_time: next(),
            backlog_wait_time_actual: next(),
        })
    }
}
