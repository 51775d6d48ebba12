use anyhow::{Context, Result, bail, ensure};
use audit_channel::{ChannelError, DecodedEvent, EventChannel};
use audit_rule::RuleBuilder;
use nix::unistd::geteuid;
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    cli::KauditOpts,
    config::KauditConfig,
    term_print::{TermPrintable, print_event},
};

pub async fn kaudit_run(options: &KauditOpts) -> Result<()> {
    log::trace!("kaudit options: {:?}", options);

    let config = if let Some(custom_file) = &options.config_file {
        KauditConfig::with_custom_file(custom_file)?
    } else {
        KauditConfig::new()?
    };

    let mut channel_config = config.channel().context("invalid [channel] section")?;
    channel_config.raw_delivery |= options.raw;
    let mut rule_config = config.rule().context("invalid [rule] section")?;
    options.merge_into(&mut rule_config);
    if rule_config.is_empty() {
        bail!("Nothing to audit: pass --syscall, --watch, --watch-file or --field");
    }

    let mut builder = RuleBuilder::native()?;
    rule_config.apply(&mut builder).context("invalid rule")?;
    builder.term_print()?;
    if options.dry_run {
        return Ok(());
    }
    let rule = builder.build();
    let (flags, action) = (rule.flags(), rule.action());

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let mut channel = EventChannel::open(channel_config.options())?;
    if channel_config.enable_auditing {
        channel.set_enabled(true).context("enabling auditing")?;
    }
    if channel_config.register_listener {
        channel
            .register_listener()
            .context("registering as audit listener, is auditd running?")?;
    }
    match channel.status() {
        Ok(status) => {
            status.term_print()?;
        }
        Err(err) => log::warn!("Reading audit status failed: {err}"),
    }
    channel
        .install_rule(&rule, flags, action)
        .context("installing rule")?;

    let stop = channel.stop_signal();
    let mut listener = tokio::task::spawn_blocking(move || {
        let result = channel.listen(|event: DecodedEvent| print_event(&event));
        (channel, result)
    });

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let joined = tokio::select! {
        _ = sig_int.recv() => { log::trace!("SIGINT received"); None }
        _ = sig_term.recv() => { log::trace!("SIGTERM received"); None }
        joined = &mut listener => Some(joined),
    };
    let (mut channel, result) = match joined {
        Some(joined) => joined,
        None => {
            stop.raise();
            listener.await
        }
    }
    .context("audit listener task")?;

    log::info!("Terminating kaudit...");
    if !options.keep_rule {
        match channel.delete_rule(&rule, flags, action) {
            Ok(()) => {}
            Err(ChannelError::RuleNotFound) => log::warn!("Rule was already removed"),
            Err(err) => log::warn!("Deleting rule failed: {err}"),
        }
    }
    channel.close();

    result.context("receiving audit events")
}
