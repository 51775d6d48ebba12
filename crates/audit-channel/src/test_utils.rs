//! In-memory stand-in for the kernel audit subsystem.

use std::collections::VecDeque;

use audit_rule::{AuditRule, MAX_MESSAGE_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use nix::errno::Errno;

use crate::{
    MessageType, StopSignal,
    message::{NLMSG_HDRLEN, NetlinkHeader, ReplyMessage, encode_request},
    status::{AuditStatus, mask},
    transport::{Transport, Wait},
};

/// Answers rule and status requests like the kernel and replays scripted
/// records, one datagram per [`Transport::recv`].
#[derive(Debug, Default)]
pub struct MockKernel {
    rules: Vec<Bytes>,
    status: AuditStatus,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<ReplyMessage>,
    deny: Option<Errno>,
    muted: bool,
    on_drained: Option<StopSignal>,
}

impl MockKernel {
    /// Queue an audit record as its own datagram, framed like `audit_log_end`
    /// does: `len` counts the text only and nothing is padded.
    pub fn push_record(&mut self, msg_type: MessageType, text: &str) {
        let mut datagram = BytesMut::new();
        NetlinkHeader {
            len: text.len() as u32,
            msg_type,
            flags: 0,
            seq: 0,
            pid: 0,
        }
        .encode(&mut datagram);
        datagram.put_slice(text.as_bytes());
        self.push_raw(datagram.to_vec());
    }

    /// Queue a raw datagram.
    pub fn push_raw(&mut self, datagram: Vec<u8>) {
        self.inbox.push_back(datagram);
    }

    /// Queue a record whose header declares more than the maximum message size.
    pub fn push_oversized(&mut self, msg_type: MessageType) {
        let mut datagram = BytesMut::new();
        NetlinkHeader {
            len: (MAX_MESSAGE_LENGTH + NLMSG_HDRLEN) as u32,
            msg_type,
            flags: 0,
            seq: 0,
            pid: 0,
        }
        .encode(&mut datagram);
        datagram.put_bytes(b'x', 64);
        self.push_raw(datagram.to_vec());
    }

    /// Refuse every rule and status request with `errno`.
    pub fn deny(&mut self, errno: Errno) {
        self.deny = Some(errno);
    }

    /// Accept requests without ever answering them.
    pub fn mute(&mut self) {
        self.muted = true;
    }

    /// Raise `stop` whenever a receive finds nothing queued.
    pub fn raise_when_drained(&mut self, stop: StopSignal) {
        self.on_drained = Some(stop);
    }

    /// Serialized rules currently installed, in install order.
    pub fn rules(&self) -> &[Bytes] {
        &self.rules
    }

    pub fn status(&self) -> &AuditStatus {
        &self.status
    }

    /// Every request received so far.
    pub fn sent(&self) -> &[ReplyMessage] {
        &self.sent
    }

    fn handle(&mut self, request: &ReplyMessage) {
        let seq = request.seq();
        if let Some(errno) = self.deny {
            self.reply_errno(request, errno as i32);
            return;
        }
        let result = match request.msg_type() {
            MessageType::ADD_RULE => self.add_rule(request.payload()),
            MessageType::DEL_RULE => self.del_rule(request.payload()),
            MessageType::SET => AuditStatus::decode(request.payload())
                .map(|update| self.apply(update))
                .map_err(|_| Errno::EINVAL),
            MessageType::GET => {
                let status = self.status.encode();
                self.inbox
                    .push_back(encode_request(MessageType::GET, 0, seq, &status).to_vec());
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        };
        match result {
            Ok(()) => self.reply_errno(request, 0),
            Err(errno) => self.reply_errno(request, errno as i32),
        }
        if result.is_ok() && request.msg_type() == MessageType::ADD_RULE {
            self.push_record(
                MessageType::CONFIG_CHANGE,
                "audit(1700000000.000:1): auid=0 ses=1 op=add_rule key=(null) list=4 res=1",
            );
        }
    }

    fn add_rule(&mut self, payload: &Bytes) -> Result<(), Errno> {
        AuditRule::parse(payload).map_err(|_| Errno::EINVAL)?;
        if self.rules.contains(payload) {
            return Err(Errno::EEXIST);
        }
        self.rules.push(payload.clone());
        Ok(())
    }

    fn del_rule(&mut self, payload: &Bytes) -> Result<(), Errno> {
        AuditRule::parse(payload).map_err(|_| Errno::EINVAL)?;
        let index = self
            .rules
            .iter()
            .position(|rule| rule == payload)
            .ok_or(Errno::ENOENT)?;
        self.rules.remove(index);
        Ok(())
    }

    fn apply(&mut self, update: AuditStatus) {
        if update.mask & mask::ENABLED != 0 {
            self.status.enabled = update.enabled;
        }
        if update.mask & mask::FAILURE != 0 {
            self.status.failure = update.failure;
        }
        if update.mask & mask::PID != 0 {
            self.status.pid = update.pid;
        }
    }

    /// `NLMSG_ERROR` carrying `-errno` followed by the request header.
    fn reply_errno(&mut self, request: &ReplyMessage, errno: i32) {
        let mut payload = BytesMut::new();
        payload.put_i32_ne(-errno);
        request.header().encode(&mut payload);
        self.inbox.push_back(
            encode_request(MessageType::ERROR, 0, request.seq(), &payload).to_vec(),
        );
    }
}

impl Transport for MockKernel {
    fn send(&mut self, data: &[u8]) -> Result<(), nix::Error> {
        let requests = ReplyMessage::decode_all(data).map_err(|_| Errno::EINVAL)?;
        for request in requests {
            if !self.muted {
                self.handle(&request);
            }
            self.sent.push(request);
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _wait: Wait) -> Result<Option<usize>, nix::Error> {
        match self.inbox.pop_front() {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Some(len))
            }
            None => {
                if let Some(stop) = &self.on_drained {
                    stop.raise();
                }
                Ok(None)
            }
        }
    }
}
