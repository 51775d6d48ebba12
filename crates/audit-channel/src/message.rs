//! Netlink framing of audit replies.
//!
//! Every datagram read from the audit socket holds one or more netlink
//! messages, each starting with a 16 byte `nlmsghdr`:
//!
//! ```text
//! u32 len   (header included)
//! u16 type  (NLMSG_* or AUDIT_*)
//! u16 flags
//! u32 seq
//! u32 pid
//! ```
//!
//! Messages are padded to a 4 byte boundary.
//!
//! Audit records unicast by the kernel break the convention: their `len`
//! counts the payload only and the datagram carries no padding. A record
//! whose `len` plus the header size equals the datagram size is read that
//! way.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use audit_rule::MAX_MESSAGE_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ChannelError;

pub const NLMSG_HDRLEN: usize = 16;
const NLMSG_ALIGNTO: usize = 4;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;

/// Netlink or audit message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const NOOP: Self = Self(1);
    pub const ERROR: Self = Self(2);
    pub const DONE: Self = Self(3);
    pub const GET: Self = Self(1000);
    pub const SET: Self = Self(1001);
    pub const ADD_RULE: Self = Self(1011);
    pub const DEL_RULE: Self = Self(1012);
    pub const LIST_RULES: Self = Self(1013);
    pub const SYSCALL: Self = Self(1300);
    pub const PATH: Self = Self(1302);
    pub const CONFIG_CHANGE: Self = Self(1305);
    pub const CWD: Self = Self(1307);
    pub const EXECVE: Self = Self(1309);
    pub const EOE: Self = Self(1320);
    pub const PROCTITLE: Self = Self(1327);

    pub fn code(self) -> u16 {
        self.0
    }

    /// Name as printed by `ausearch`, when known.
    pub fn name(self) -> Option<&'static str> {
        MESSAGE_NAMES
            .binary_search_by_key(&self.0, |(code, _)| *code)
            .ok()
            .map(|index| MESSAGE_NAMES[index].1)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        MESSAGE_NAMES
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(code, _)| Self(*code))
    }

    /// Records that belong to a larger event and are closed by [`MessageType::EOE`].
    pub fn is_continuation(self) -> bool {
        matches!(self, Self::PATH | Self::PROCTITLE)
    }

    /// Event records emitted by `audit_log`, as opposed to replies to requests.
    pub fn is_record(self) -> bool {
        self.0 >= 1100
    }

    /// Netlink control messages, as opposed to audit payloads.
    pub fn is_control(self) -> bool {
        self.0 < 16
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN[{}]", self.0),
        }
    }
}

/// Sorted by code.
static MESSAGE_NAMES: &[(u16, &str)] = &[
    (1, "NOOP"),
    (2, "ERROR"),
    (3, "DONE"),
    (1000, "GET"),
    (1001, "SET"),
    (1002, "LIST"),
    (1003, "ADD"),
    (1004, "DEL"),
    (1005, "USER"),
    (1006, "LOGIN"),
    (1007, "WATCH_INS"),
    (1008, "WATCH_REM"),
    (1009, "WATCH_LIST"),
    (1010, "SIGNAL_INFO"),
    (1011, "ADD_RULE"),
    (1012, "DEL_RULE"),
    (1013, "LIST_RULES"),
    (1014, "TRIM"),
    (1015, "MAKE_EQUIV"),
    (1016, "TTY_GET"),
    (1017, "TTY_SET"),
    (1018, "SET_FEATURE"),
    (1019, "GET_FEATURE"),
    (1107, "USER_AVC"),
    (1124, "USER_TTY"),
    (1200, "DAEMON_START"),
    (1201, "DAEMON_END"),
    (1202, "DAEMON_ABORT"),
    (1203, "DAEMON_CONFIG"),
    (1300, "SYSCALL"),
    (1302, "PATH"),
    (1303, "IPC"),
    (1304, "SOCKETCALL"),
    (1305, "CONFIG_CHANGE"),
    (1306, "SOCKADDR"),
    (1307, "CWD"),
    (1309, "EXECVE"),
    (1311, "IPC_SET_PERM"),
    (1312, "MQ_OPEN"),
    (1313, "MQ_SENDRECV"),
    (1314, "MQ_NOTIFY"),
    (1315, "MQ_GETSETATTR"),
    (1316, "KERNEL_OTHER"),
    (1317, "FD_PAIR"),
    (1318, "OBJ_PID"),
    (1319, "TTY"),
    (1320, "EOE"),
    (1321, "BPRM_FCAPS"),
    (1322, "CAPSET"),
    (1323, "MMAP"),
    (1324, "NETFILTER_PKT"),
    (1325, "NETFILTER_CFG"),
    (1326, "SECCOMP"),
    (1327, "PROCTITLE"),
    (1328, "FEATURE_CHANGE"),
    (1329, "REPLACE"),
    (1330, "KERN_MODULE"),
    (1331, "FANOTIFY"),
    (1332, "TIME_INJOFFSET"),
    (1333, "TIME_ADJNTPVAL"),
    (1334, "BPF"),
    (1335, "EVENT_LISTENER"),
    (1336, "URINGOP"),
    (1337, "OPENAT2"),
    (1338, "DM_CTRL"),
    (1339, "DM_EVENT"),
    (1400, "AVC"),
    (1401, "SELINUX_ERR"),
    (1402, "AVC_PATH"),
    (1403, "MAC_POLICY_LOAD"),
    (1404, "MAC_STATUS"),
    (1405, "MAC_CONFIG_CHANGE"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkHeader {
    pub len: u32,
    pub msg_type: MessageType,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NetlinkHeader {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_ne(self.len);
        out.put_u16_ne(self.msg_type.code());
        out.put_u16_ne(self.flags);
        out.put_u32_ne(self.seq);
        out.put_u32_ne(self.pid);
    }

    /// The caller guarantees at least [`NLMSG_HDRLEN`] bytes.
    fn decode(mut data: &[u8]) -> Self {
        Self {
            len: data.get_u32_ne(),
            msg_type: MessageType(data.get_u16_ne()),
            flags: data.get_u16_ne(),
            seq: data.get_u32_ne(),
            pid: data.get_u32_ne(),
        }
    }
}

/// Build a request datagram.
pub fn encode_request(msg_type: MessageType, flags: u16, seq: u32, payload: &[u8]) -> Bytes {
    let len = NLMSG_HDRLEN + payload.len();
    let mut out = BytesMut::with_capacity(align(len));
    NetlinkHeader {
        len: len as u32,
        msg_type,
        flags,
        seq,
        pid: 0,
    }
    .encode(&mut out);
    out.put_slice(payload);
    out.put_bytes(0, align(len) - len);
    out.freeze()
}

fn align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// One decoded netlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    header: NetlinkHeader,
    payload: Bytes,
}

impl ReplyMessage {
    pub fn new(header: NetlinkHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Split a received datagram into its messages.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<ReplyMessage>, ChannelError> {
        let mut messages = Vec::new();
        while !data.is_empty() {
            if data.len() < NLMSG_HDRLEN {
                return Err(ChannelError::MalformedMessage(format!(
                    "{} trailing bytes are shorter than a netlink header",
                    data.len()
                )));
            }
            let header = NetlinkHeader::decode(data);
            let declared = header.len as usize;
            if declared > MAX_MESSAGE_LENGTH {
                return Err(ChannelError::MalformedMessage(format!(
                    "declared length {declared} exceeds the maximum of {MAX_MESSAGE_LENGTH}"
                )));
            }
            let len = if header.msg_type.is_record() && declared + NLMSG_HDRLEN == data.len() {
                declared + NLMSG_HDRLEN
            } else {
                declared
            };
            if len < NLMSG_HDRLEN {
                return Err(ChannelError::MalformedMessage(format!(
                    "declared length {len} is shorter than the header"
                )));
            }
            if len > data.len() {
                return Err(ChannelError::MalformedMessage(format!(
                    "declared length {len} but only {} bytes received",
                    data.len()
                )));
            }
            let message = ReplyMessage {
                header,
                payload: Bytes::copy_from_slice(&data[NLMSG_HDRLEN..len]),
            };
            if message.msg_type() == MessageType::ERROR && message.payload.len() < 4 {
                return Err(ChannelError::MalformedMessage(
                    "error reply without an error code".to_string(),
                ));
            }
            messages.push(message);
            data = &data[align(len).min(data.len())..];
        }
        Ok(messages)
    }

    pub fn header(&self) -> &NetlinkHeader {
        &self.header
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// For `NLMSG_ERROR` replies: `Some(0)` is an ack, otherwise the errno.
    pub fn error_code(&self) -> Option<i32> {
        if self.msg_type() != MessageType::ERROR || self.payload.len() < 4 {
            return None;
        }
        let mut payload = &self.payload[..];
        Some(-payload.get_i32_ne())
    }

    /// Record text, without trailing NUL bytes.
    pub fn text(&self) -> String {
        let end = self
            .payload
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Parse the `audit(<sec>.<msec>:<serial>):` prefix of a record.
    pub fn event_id(&self) -> Option<EventId> {
        EventId::parse(&self.payload)
    }

    /// Record text after the `audit(...):` prefix.
    pub fn body(&self) -> String {
        let text = self.text();
        match text.strip_prefix("audit(").and_then(|rest| rest.split_once("): ")) {
            Some((_, body)) => body.to_string(),
            None => text,
        }
    }
}

impl fmt::Display for ReplyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={} msg={}", self.msg_type(), self.text())
    }
}

/// Identity shared by every record of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub secs: u64,
    pub millis: u32,
    pub serial: u64,
}

impl EventId {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let rest = payload.strip_prefix(b"audit(")?;
        let end = rest.iter().position(|b| *b == b')')?;
        let inner = std::str::from_utf8(&rest[..end]).ok()?;
        let (time, serial) = inner.split_once(':')?;
        let (secs, millis) = time.split_once('.')?;
        Some(Self {
            secs: secs.parse().ok()?,
            millis: millis.parse().ok()?,
            serial: serial.parse().ok()?,
        })
    }

    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.secs) + Duration::from_millis(self.millis.into())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}:{}", self.secs, self.millis, self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(msg_type: MessageType, declared: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        NetlinkHeader {
            len: declared,
            msg_type,
            flags: 0,
            seq: 0,
            pid: 0,
        }
        .encode(&mut out);
        out.put_slice(payload);
        out.to_vec()
    }

    #[test]
    fn names() {
        assert_eq!(MessageType::EOE.to_string(), "EOE");
        assert_eq!(MessageType(4242).to_string(), "UNKNOWN[4242]");
        assert_eq!(MessageType::from_name("PROCTITLE"), Some(MessageType::PROCTITLE));
        assert!(MESSAGE_NAMES.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert!(MessageType::PATH.is_continuation());
        assert!(!MessageType::SYSCALL.is_continuation());
        assert!(MessageType::ERROR.is_control());
    }

    #[test]
    fn request_is_padded() {
        let request = encode_request(MessageType::SET, NLM_F_REQUEST | NLM_F_ACK, 7, &[1, 2, 3]);
        assert_eq!(request.len(), 20);
        let messages = ReplyMessage::decode_all(&request).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type(), MessageType::SET);
        assert_eq!(messages[0].seq(), 7);
        assert_eq!(messages[0].header().flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(&messages[0].payload()[..], &[1, 2, 3]);
    }

    #[test]
    fn several_messages_per_datagram() {
        let mut data = encode_request(MessageType::PATH, 0, 1, b"item=0").to_vec();
        data.extend_from_slice(&encode_request(MessageType::EOE, 0, 1, b""));
        let messages = ReplyMessage::decode_all(&data).unwrap();
        let types: Vec<_> = messages.iter().map(ReplyMessage::msg_type).collect();
        assert_eq!(types, vec![MessageType::PATH, MessageType::EOE]);
        assert_eq!(messages[0].text(), "item=0");
    }

    #[test]
    fn kernel_framed_records() {
        let text = b"audit(1700000000.042:1234): arch=c000003e syscall=83";
        let syscall = datagram(MessageType::SYSCALL, text.len() as u32, text);
        let messages = ReplyMessage::decode_all(&syscall).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].payload()[..], &text[..]);
        assert_eq!(messages[0].event_id().map(|id| id.serial), Some(1234));

        let text = b"audit(1.000:2): ";
        let eoe = datagram(MessageType::EOE, text.len() as u32, text);
        let messages = ReplyMessage::decode_all(&eoe).unwrap();
        assert_eq!(messages[0].text(), "audit(1.000:2): ");

        // replies to requests keep the regular framing
        let ack = datagram(MessageType::ERROR, 4, &[0; 20]);
        assert!(matches!(
            ReplyMessage::decode_all(&ack),
            Err(ChannelError::MalformedMessage(_))
        ));
    }

    #[test]
    fn malformed_lengths() {
        let too_long = datagram(MessageType::SYSCALL, (MAX_MESSAGE_LENGTH + 1) as u32, b"x");
        assert!(matches!(
            ReplyMessage::decode_all(&too_long),
            Err(ChannelError::MalformedMessage(_))
        ));
        let zero = datagram(MessageType::GET, 0, b"");
        assert!(matches!(
            ReplyMessage::decode_all(&zero),
            Err(ChannelError::MalformedMessage(_))
        ));
        let truncated = datagram(MessageType::SYSCALL, 64, b"short");
        assert!(matches!(
            ReplyMessage::decode_all(&truncated),
            Err(ChannelError::MalformedMessage(_))
        ));
        assert!(matches!(
            ReplyMessage::decode_all(&[0; 5]),
            Err(ChannelError::MalformedMessage(_))
        ));
        let error = datagram(MessageType::ERROR, 18, b"ab");
        assert!(matches!(
            ReplyMessage::decode_all(&error),
            Err(ChannelError::MalformedMessage(_))
        ));
    }

    #[test]
    fn error_codes() {
        let ack = encode_request(MessageType::ERROR, 0, 1, &0i32.to_ne_bytes());
        let eexist = encode_request(MessageType::ERROR, 0, 1, &(-17i32).to_ne_bytes());
        let ack = &ReplyMessage::decode_all(&ack).unwrap()[0];
        let eexist = &ReplyMessage::decode_all(&eexist).unwrap()[0];
        assert_eq!(ack.error_code(), Some(0));
        assert_eq!(eexist.error_code(), Some(17));
    }

    #[test]
    fn record_prefix() {
        let record = encode_request(
            MessageType::SYSCALL,
            0,
            0,
            b"audit(1700000000.042:1234): arch=c000003e syscall=83\0",
        );
        let record = &ReplyMessage::decode_all(&record).unwrap()[0];
        let id = record.event_id().unwrap();
        assert_eq!(
            id,
            EventId {
                secs: 1_700_000_000,
                millis: 42,
                serial: 1234
            }
        );
        assert_eq!(id.to_string(), "1700000000.042:1234");
        assert_eq!(
            id.timestamp(),
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_042)
        );
        assert_eq!(record.body(), "arch=c000003e syscall=83");
        assert_eq!(
            record.to_string(),
            "type=SYSCALL msg=audit(1700000000.042:1234): arch=c000003e syscall=83"
        );
        assert_eq!(EventId::parse(b"no prefix"), None);
    }
}
