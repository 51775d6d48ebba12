use std::{env, ffi::OsString, path::PathBuf};

use audit_rule::{Action, FilterList};
use clap::{ArgAction, Parser};

use crate::config::RuleConfig;

pub const NAME: &str = "kaudit";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(version = crate::metadata::VERSION)]
#[clap(about = "Install a Linux audit rule and print the events it generates")]
pub struct KauditOpts {
    /// Configuration file, defaults to /etc/kaudit/kaudit.ini when present
    #[clap(long)]
    pub config_file: Option<String>,
    /// Syscall to audit, by name (repeatable, `all` selects every syscall)
    #[clap(short = 'S', long = "syscall")]
    pub syscalls: Vec<String>,
    /// Directory tree to watch (repeatable)
    #[clap(short = 'w', long = "watch")]
    pub watch: Vec<PathBuf>,
    /// Single file to watch (repeatable)
    #[clap(long = "watch-file")]
    pub watch_files: Vec<PathBuf>,
    /// Field predicate such as `uid>=1000` (repeatable)
    #[clap(short = 'F', long = "field")]
    pub fields: Vec<String>,
    /// Watch permissions, any of `rwxa`
    #[clap(short = 'p', long, value_parser = parse_perm)]
    pub perm: Option<u32>,
    /// Key attached to generated records
    #[clap(short = 'k', long)]
    pub key: Option<String>,
    #[clap(long)]
    pub filter_list: Option<FilterList>,
    #[clap(long)]
    pub action: Option<Action>,
    /// Print every record as it arrives instead of grouping by event
    #[clap(long)]
    pub raw: bool,
    /// Leave the rule installed on exit
    #[clap(long)]
    pub keep_rule: bool,
    /// Print the rule and exit without contacting the kernel
    #[clap(long)]
    pub dry_run: bool,
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl KauditOpts {
    pub fn override_log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }

    /// Command line values override the configuration file: lists are
    /// appended, scalars replaced.
    pub fn merge_into(&self, rule: &mut RuleConfig) {
        rule.syscalls.extend(self.syscalls.iter().cloned());
        rule.watch.extend(self.watch.iter().cloned());
        rule.watch_files.extend(self.watch_files.iter().cloned());
        rule.fields.extend(self.fields.iter().cloned());
        if let Some(perm) = self.perm {
            rule.perm = Some(perm);
        }
        if let Some(key) = &self.key {
            rule.key = Some(key.clone());
        }
        if let Some(filter_list) = self.filter_list {
            rule.filter_list = filter_list;
        }
        if let Some(action) = self.action {
            rule.action = action;
        }
    }
}

fn parse_perm(value: &str) -> Result<u32, String> {
    audit_rule::perm::parse(value)
        .ok_or_else(|| format!("{value} is not a combination of r, w, x, a"))
}

pub fn parse_from_args() -> KauditOpts {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> KauditOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<KauditOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    KauditOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One line with every cause, or the full chain plus backtrace when debugging.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KauditConfig;

    #[test]
    fn parse_flags() {
        let opts = try_parse_from([
            "kaudit", "-S", "mkdir", "--syscall", "rmdir", "-w", "/tmp/", "-p", "wa", "-k",
            "tmp", "--action", "always", "--filter-list", "exit", "-vv",
        ])
        .unwrap();
        assert_eq!(opts.syscalls, vec!["mkdir", "rmdir"]);
        assert_eq!(opts.watch, vec![PathBuf::from("/tmp/")]);
        assert_eq!(opts.perm, Some(audit_rule::perm::WRITE | audit_rule::perm::ATTR));
        assert_eq!(opts.key.as_deref(), Some("tmp"));
        assert_eq!(opts.action, Some(Action::Always));
        assert_eq!(opts.filter_list, Some(FilterList::Exit));
        assert_eq!(opts.override_log_level(), log::LevelFilter::Trace);
        assert!(!opts.keep_rule);
    }

    #[test]
    fn reject_bad_perm() {
        assert!(try_parse_from(["kaudit", "-p", "z"]).is_err());
        assert!(try_parse_from(["kaudit", "--action", "sometimes"]).is_err());
    }

    #[test]
    fn flags_override_config() {
        let config =
            KauditConfig::from_ini_str("[rule]\nsyscalls = mkdir\nkey = file\naction = never\n")
                .unwrap();
        let mut rule = config.rule().unwrap();
        let opts = try_parse_from(["kaudit", "-S", "rmdir", "-k", "cli"]).unwrap();
        opts.merge_into(&mut rule);
        assert_eq!(rule.syscalls, vec!["mkdir", "rmdir"]);
        assert_eq!(rule.key.as_deref(), Some("cli"));
        assert_eq!(rule.action, Action::Never);
    }

    #[test]
    fn verbosity() {
        assert_eq!(log_level_from_verbosity_flag_count(0), log::LevelFilter::Info);
        assert_eq!(log_level_from_verbosity_flag_count(1), log::LevelFilter::Debug);
    }
}
