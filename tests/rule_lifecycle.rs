use audit_channel::{
    ChannelError, ChannelOptions, EventChannel, MessageType, test_utils::MockKernel,
};
use audit_rule::{AuditRule, Field, Machine, RuleBuilder};
use kaudit::{cli, config::KauditConfig};

fn build_rule(args: &[&str]) -> AuditRule {
    let opts = cli::try_parse_from(args.iter().copied()).unwrap();
    let mut rule = KauditConfig::default().rule().unwrap();
    opts.merge_into(&mut rule);
    let mut builder = RuleBuilder::new(Machine::X86_64);
    rule.apply(&mut builder).unwrap();
    builder.build()
}

#[test]
fn install_listen_delete() {
    let rule = build_rule(&["kaudit", "-S", "mkdir", "-w", "/home/user/watched/", "-k", "w"]);
    let (flags, action) = (rule.flags(), rule.action());
    assert_eq!(
        rule.strings().map(|(field, _)| field).collect::<Vec<_>>(),
        vec![Field::Dir, Field::FilterKey]
    );
    assert_eq!(rule.buf(), b"/home/user/watchedw");

    let mut kernel = MockKernel::default();
    kernel.push_record(MessageType::SYSCALL, "audit(1700000000.100:20): syscall=83 key=\"w\"");
    kernel.push_record(MessageType::CWD, "audit(1700000000.100:20): cwd=\"/home/user\"");
    kernel.push_record(MessageType::PATH, "audit(1700000000.100:20): item=0 name=\"watched/\"");
    kernel.push_record(MessageType::PATH, "audit(1700000000.100:20): item=1 name=\"new\"");
    kernel.push_record(MessageType::PROCTITLE, "audit(1700000000.100:20): proctitle=6D6B646972");
    kernel.push_record(MessageType::EOE, "audit(1700000000.100:20): ");

    let mut channel = EventChannel::with_transport(kernel, ChannelOptions::default());
    channel.install_rule(&rule, flags, action).unwrap();
    assert_eq!(channel.transport().rules().len(), 1);

    let stop = channel.stop_signal();
    channel.transport_mut().raise_when_drained(stop);
    let mut events = Vec::new();
    channel.listen(|event| events.push(event)).unwrap();

    let types: Vec<_> = events.iter().map(|event| event.primary_type()).collect();
    assert_eq!(
        types,
        vec![
            MessageType::SYSCALL,
            MessageType::CWD,
            MessageType::EOE,
            MessageType::CONFIG_CHANGE,
        ]
    );
    assert_eq!(events[2].continuations().len(), 3);
    assert_eq!(events[2].id().unwrap().serial, 20);

    channel.delete_rule(&rule, flags, action).unwrap();
    assert!(matches!(
        channel.delete_rule(&rule, flags, action),
        Err(ChannelError::RuleNotFound)
    ));
}
