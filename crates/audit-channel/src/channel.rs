use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use audit_rule::{Action, AuditRule, FilterList, MAX_MESSAGE_LENGTH};
use nix::{errno::Errno, unistd::getpid};

use crate::{
    ChannelError,
    event::{DecodedEvent, EventAccumulator},
    message::{MessageType, NLM_F_ACK, NLM_F_REQUEST, ReplyMessage, encode_request},
    status::AuditStatus,
    transport::{NetlinkTransport, Transport, Wait},
};

const RECV_BUFFER_SIZE: usize = 2 * MAX_MESSAGE_LENGTH;

/// Cooperative cancellation of a blocking receive.
///
/// Checked between waits of at most [`ChannelOptions::poll_interval`], so a
/// raised signal ends a blocking receive within one interval.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Upper bound of a single wait inside a blocking receive.
    pub poll_interval: Duration,
    /// How long a request waits for its ack.
    pub reply_timeout: Duration,
    /// Deliver every record as its own event, without aggregation.
    pub raw_delivery: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            reply_timeout: Duration::from_secs(1),
            raw_delivery: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Wait until an event is complete or the stop signal is raised.
    Blocking,
    /// Process what is already available and return.
    NonBlocking,
}

/// Request/reply and event stream over one audit socket.
///
/// Only one operation may run at a time: the partial-event accumulator is
/// shared between receive calls.
pub struct EventChannel<T = NetlinkTransport> {
    transport: T,
    options: ChannelOptions,
    stop: StopSignal,
    seq: u32,
    pending: VecDeque<ReplyMessage>,
    accumulator: EventAccumulator,
    buffer: Vec<u8>,
}

impl EventChannel<NetlinkTransport> {
    /// Open the kernel audit socket.
    pub fn open(options: ChannelOptions) -> Result<Self, ChannelError> {
        let transport = NetlinkTransport::open().map_err(|err| match err {
            Errno::EPERM | Errno::EACCES => ChannelError::PermissionDenied(err),
            _ => ChannelError::Unavailable(err),
        })?;
        Ok(Self::with_transport(transport, options))
    }
}

impl<T: Transport> EventChannel<T> {
    pub fn with_transport(transport: T, options: ChannelOptions) -> Self {
        Self {
            transport,
            options,
            stop: StopSignal::default(),
            seq: 0,
            pending: VecDeque::new(),
            accumulator: EventAccumulator::default(),
            buffer: vec![0; RECV_BUFFER_SIZE],
        }
    }

    /// Handle raising the stop condition of blocking receives.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Continuation records of the event being aggregated.
    pub fn partial_records(&self) -> usize {
        self.accumulator.len()
    }

    pub fn install_rule(
        &mut self,
        rule: &AuditRule,
        flags: FilterList,
        action: Action,
    ) -> Result<(), ChannelError> {
        let rule = rule.with_target(flags, action);
        self.request(MessageType::ADD_RULE, &rule.serialize())?;
        log::info!("installed rule {rule}");
        Ok(())
    }

    pub fn delete_rule(
        &mut self,
        rule: &AuditRule,
        flags: FilterList,
        action: Action,
    ) -> Result<(), ChannelError> {
        let rule = rule.with_target(flags, action);
        self.request(MessageType::DEL_RULE, &rule.serialize())?;
        log::info!("deleted rule {rule}");
        Ok(())
    }

    /// Turn kernel auditing on or off.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), ChannelError> {
        self.request(MessageType::SET, &AuditStatus::enable(enabled).encode())?;
        log::debug!("auditing enabled: {enabled}");
        Ok(())
    }

    /// Make this process the audit daemon, so records are unicast to this socket.
    pub fn register_listener(&mut self) -> Result<(), ChannelError> {
        let pid = getpid().as_raw() as u32;
        self.request(MessageType::SET, &AuditStatus::listener(pid).encode())?;
        log::debug!("registered pid {pid} as audit listener");
        Ok(())
    }

    pub fn status(&mut self) -> Result<AuditStatus, ChannelError> {
        match self.request(MessageType::GET, &[])? {
            Some(reply) => AuditStatus::decode(reply.payload()),
            None => Err(ChannelError::NoReply {
                msg_type: MessageType::GET,
                seq: self.seq,
            }),
        }
    }

    /// Receive the next complete event.
    ///
    /// Continuation records (PATH, PROCTITLE) are held back until the EOE
    /// marker closing their event arrives, and the call returns `Ok(None)`
    /// after absorbing one. In [`ReceiveMode::NonBlocking`] the call also
    /// returns `Ok(None)` when nothing is pending. A blocking call returns
    /// [`ChannelError::Interrupted`] once the stop signal is raised.
    ///
    /// A malformed datagram discards the partially aggregated event; the
    /// channel stays usable.
    pub fn receive_event(
        &mut self,
        mode: ReceiveMode,
    ) -> Result<Option<DecodedEvent>, ChannelError> {
        match self.next_message(mode)? {
            Some(message) => Ok(self.dispatch(message)),
            None => Ok(None),
        }
    }

    /// Deliver events to `callback` until the stop signal is raised.
    ///
    /// Malformed datagrams are logged and skipped, other errors end the loop.
    pub fn listen(&mut self, mut callback: impl FnMut(DecodedEvent)) -> Result<(), ChannelError> {
        loop {
            match self.receive_event(ReceiveMode::Blocking) {
                Ok(Some(event)) => callback(event),
                Ok(None) => {}
                Err(ChannelError::Interrupted) => return Ok(()),
                Err(err @ ChannelError::MalformedMessage(_)) => log::warn!("{err}"),
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the channel, dropping any partially aggregated event.
    pub fn close(mut self) {
        self.accumulator.reset();
        log::debug!("closing audit channel");
    }

    fn dispatch(&mut self, message: ReplyMessage) -> Option<DecodedEvent> {
        let msg_type = message.msg_type();
        if self.options.raw_delivery {
            Some(DecodedEvent::standalone(message))
        } else if msg_type.is_continuation() {
            self.accumulator.push(message);
            None
        } else if msg_type == MessageType::EOE {
            Some(self.accumulator.drain(message))
        } else {
            Some(DecodedEvent::standalone(message))
        }
    }

    fn next_message(&mut self, mode: ReceiveMode) -> Result<Option<ReplyMessage>, ChannelError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            let wait = match mode {
                ReceiveMode::NonBlocking => Wait::NonBlocking,
                ReceiveMode::Blocking if self.stop.is_raised() => {
                    return Err(ChannelError::Interrupted);
                }
                ReceiveMode::Blocking => Wait::Timeout(self.options.poll_interval),
            };
            match self.receive(wait)? {
                Some(messages) => self.pending.extend(messages),
                None if mode == ReceiveMode::NonBlocking => return Ok(None),
                None => {}
            }
        }
    }

    fn receive(&mut self, wait: Wait) -> Result<Option<Vec<ReplyMessage>>, ChannelError> {
        let Some(len) = self
            .transport
            .recv(&mut self.buffer, wait)
            .map_err(ChannelError::Transport)?
        else {
            return Ok(None);
        };
        match ReplyMessage::decode_all(&self.buffer[..len]) {
            Ok(messages) => Ok(Some(messages)),
            Err(err) => {
                self.accumulator.reset();
                Err(err)
            }
        }
    }

    /// Send a request and wait for its ack. Returns the non-ack reply
    /// carrying the same sequence number, if any. Unrelated records are
    /// queued for [`EventChannel::receive_event`], malformed datagrams and
    /// acks of earlier requests are dropped.
    fn request(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<Option<ReplyMessage>, ChannelError> {
        self.seq = self.seq.wrapping_add(1).max(1);
        let seq = self.seq;
        let data = encode_request(msg_type, NLM_F_REQUEST | NLM_F_ACK, seq, payload);
        self.transport
            .send(&data)
            .map_err(ChannelError::Transport)?;
        log::trace!("sent {msg_type} request {seq}");

        let deadline = Instant::now() + self.options.reply_timeout;
        let mut reply = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::NoReply { msg_type, seq });
            }
            let messages = match self.receive(Wait::Timeout(remaining)) {
                Ok(Some(messages)) => messages,
                Ok(None) => continue,
                // not the ack, which can still arrive
                Err(err @ ChannelError::MalformedMessage(_)) => {
                    log::warn!("{err} while waiting for {msg_type} ack {seq}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut messages = messages.into_iter();
            while let Some(message) = messages.next() {
                if message.seq() != seq {
                    if message.msg_type() == MessageType::ERROR {
                        log::debug!("dropping stale reply to request {}", message.seq());
                    } else {
                        self.pending.push_back(message);
                    }
                    continue;
                }
                match message.error_code() {
                    Some(0) => {
                        self.pending.extend(messages);
                        return Ok(reply);
                    }
                    Some(errno) => {
                        self.pending.extend(messages);
                        return Err(ChannelError::from_errno(errno));
                    }
                    None => reply = Some(message),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use audit_rule::{Machine, RuleBuilder};

    use super::*;
    use crate::test_utils::MockKernel;

    fn channel(kernel: MockKernel) -> EventChannel<MockKernel> {
        EventChannel::with_transport(kernel, ChannelOptions::default())
    }

    fn mkdir_rule() -> AuditRule {
        let mut builder = RuleBuilder::new(Machine::X86_64);
        builder.add_syscall_by_name("mkdir").unwrap();
        builder.add_watch_path("/tmp/watched").unwrap();
        builder.build()
    }

    #[test]
    fn path_records_aggregate_until_eoe() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::PATH, "audit(1700000000.000:7): item=0 name=\"/tmp\"");
        kernel.push_record(MessageType::PATH, "audit(1700000000.000:7): item=1 name=\"x\"");
        kernel.push_record(MessageType::EOE, "audit(1700000000.000:7): ");
        let mut channel = channel(kernel);

        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
        assert_eq!(channel.partial_records(), 2);
        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(event.primary_type(), MessageType::EOE);
        assert_eq!(event.continuations().len(), 2);
        assert_eq!(event.id().unwrap().serial, 7);
        assert_eq!(channel.partial_records(), 0);
    }

    #[test]
    fn lone_eoe_is_an_event() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::EOE, "audit(1700000000.000:8): ");
        let mut channel = channel(kernel);
        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert!(event.continuations().is_empty());
    }

    #[test]
    fn other_records_are_standalone() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::PROCTITLE, "audit(1.000:1): proctitle=6D6B646972");
        kernel.push_record(MessageType::SYSCALL, "audit(1.000:1): syscall=83");
        let mut channel = channel(kernel);
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(event.primary_type(), MessageType::SYSCALL);
        assert!(event.continuations().is_empty());
        // the PROCTITLE stays queued for the next EOE
        assert_eq!(channel.partial_records(), 1);
    }

    #[test]
    fn non_blocking_returns_none_when_idle() {
        let mut channel = channel(MockKernel::default());
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
    }

    #[test]
    fn raw_delivery_skips_aggregation() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::PATH, "audit(1.000:1): item=0");
        kernel.push_record(MessageType::EOE, "audit(1.000:1): ");
        let options = ChannelOptions {
            raw_delivery: true,
            ..Default::default()
        };
        let mut channel = EventChannel::with_transport(kernel, options);
        let first = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(first.primary_type(), MessageType::PATH);
        let second = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(second.primary_type(), MessageType::EOE);
        assert!(second.continuations().is_empty());
    }

    #[test]
    fn malformed_message_resets_accumulator() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::PATH, "audit(1.000:1): item=0");
        kernel.push_oversized(MessageType::PATH);
        kernel.push_record(MessageType::EOE, "audit(1.000:2): ");
        let mut channel = channel(kernel);

        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
        assert_eq!(channel.partial_records(), 1);
        assert!(matches!(
            channel.receive_event(ReceiveMode::NonBlocking),
            Err(ChannelError::MalformedMessage(_))
        ));
        assert_eq!(channel.partial_records(), 0);
        // still usable
        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert!(event.continuations().is_empty());
    }

    #[test]
    fn blocking_receive_stops_on_signal() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::SYSCALL, "audit(1.000:1): syscall=83");
        let mut channel = channel(kernel);
        let stop = channel.stop_signal();
        channel.transport_mut().raise_when_drained(stop);

        assert!(channel.receive_event(ReceiveMode::Blocking).unwrap().is_some());
        assert!(matches!(
            channel.receive_event(ReceiveMode::Blocking),
            Err(ChannelError::Interrupted)
        ));
    }

    #[test]
    fn blocking_receive_waits_for_eoe() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::PATH, "audit(1.000:3): item=0");
        kernel.push_record(MessageType::EOE, "audit(1.000:3): ");
        let mut channel = channel(kernel);
        let stop = channel.stop_signal();
        channel.transport_mut().raise_when_drained(stop);

        let first = channel.receive_event(ReceiveMode::Blocking).unwrap();
        assert!(first.is_none());
        let event = channel.receive_event(ReceiveMode::Blocking).unwrap().unwrap();
        assert_eq!(event.continuations().len(), 1);
    }

    #[test]
    fn install_and_delete() {
        let mut channel = channel(MockKernel::default());
        let rule = mkdir_rule();
        channel
            .install_rule(&rule, FilterList::Exit, Action::Always)
            .unwrap();
        assert_eq!(channel.transport().rules().len(), 1);
        let installed = AuditRule::parse(&channel.transport().rules()[0]).unwrap();
        assert_eq!(installed.flags(), FilterList::Exit);
        assert_eq!(installed.action(), Action::Always);
        assert!(installed.has_syscall(83));

        assert!(matches!(
            channel.install_rule(&rule, FilterList::Exit, Action::Always),
            Err(ChannelError::DuplicateRule)
        ));
        channel
            .delete_rule(&rule, FilterList::Exit, Action::Always)
            .unwrap();
        assert!(channel.transport().rules().is_empty());
    }

    #[test]
    fn delete_unknown_rule() {
        let mut channel = channel(MockKernel::default());
        assert!(matches!(
            channel.delete_rule(&mkdir_rule(), FilterList::Exit, Action::Always),
            Err(ChannelError::RuleNotFound)
        ));
    }

    #[test]
    fn kernel_refusals() {
        let mut kernel = MockKernel::default();
        kernel.deny(Errno::EPERM);
        let mut channel = channel(kernel);
        assert!(matches!(
            channel.install_rule(&mkdir_rule(), FilterList::Exit, Action::Always),
            Err(ChannelError::NotPermitted)
        ));
    }

    #[test]
    fn records_during_install_are_kept() {
        let mut kernel = MockKernel::default();
        kernel.push_record(MessageType::SYSCALL, "audit(1.000:1): syscall=83");
        let mut channel = channel(kernel);
        channel
            .install_rule(&mkdir_rule(), FilterList::Exit, Action::Always)
            .unwrap();

        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(event.primary_type(), MessageType::SYSCALL);
        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(event.primary_type(), MessageType::CONFIG_CHANGE);
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
    }

    #[test]
    fn malformed_record_during_install() {
        let mut kernel = MockKernel::default();
        kernel.push_oversized(MessageType::PATH);
        let mut channel = channel(kernel);
        channel
            .install_rule(&mkdir_rule(), FilterList::Exit, Action::Always)
            .unwrap();
        assert_eq!(channel.transport().rules().len(), 1);

        let event = channel
            .receive_event(ReceiveMode::NonBlocking)
            .unwrap()
            .unwrap();
        assert_eq!(event.primary_type(), MessageType::CONFIG_CHANGE);
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
    }

    #[test]
    fn stale_acks_are_dropped() {
        let mut kernel = MockKernel::default();
        kernel.push_raw(encode_request(MessageType::ERROR, 0, 42, &0i32.to_ne_bytes()).to_vec());
        let mut channel = channel(kernel);
        channel.set_enabled(true).unwrap();
        assert!(channel.receive_event(ReceiveMode::NonBlocking).unwrap().is_none());
    }

    #[test]
    fn enable_register_and_status() {
        let mut channel = channel(MockKernel::default());
        channel.set_enabled(true).unwrap();
        channel.register_listener().unwrap();
        let status = channel.status().unwrap();
        assert!(status.is_enabled());
        assert_eq!(status.pid, std::process::id());
    }

    #[test]
    fn requests_use_increasing_sequence_numbers() {
        let mut channel = channel(MockKernel::default());
        channel.set_enabled(true).unwrap();
        channel.set_enabled(false).unwrap();
        let seqs: Vec<_> = channel
            .transport()
            .sent()
            .iter()
            .map(ReplyMessage::seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(channel.transport().sent().iter().all(|request| {
            request.header().flags == NLM_F_REQUEST | NLM_F_ACK
        }));
    }

    #[test]
    fn missing_ack_times_out() {
        let mut kernel = MockKernel::default();
        kernel.mute();
        let options = ChannelOptions {
            reply_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut channel = EventChannel::with_transport(kernel, options);
        assert!(matches!(
            channel.set_enabled(true),
            Err(ChannelError::NoReply {
                msg_type: MessageType::SET,
                seq: 1
            })
        ));
    }
}
