//! kaudit installs a Linux audit rule and prints the events it generates.
//!
//! The rule is built from an `INI` configuration file and command line flags
//! (see [`config`] and [`cli`]) with [`audit_rule::RuleBuilder`], installed
//! through an [`audit_channel::EventChannel`] and removed again on exit.
//!
//! ```sh
//! # Watch a directory for writes and attribute changes
//! kaudit -S mkdir -w /home/user/watched -p wa -k watched
//! ```
//!
//! ## Configuration
//!
//! ```ini
//! [channel]
//! poll_interval_ms = 250
//! raw_delivery = false
//! enable_auditing = true
//! register_listener = true
//!
//! [rule]
//! filter_list = exit
//! action = always
//! syscalls = mkdir,rmdir
//! watch = /home/user/watched
//! perm = wa
//! key = watched
//! ```

pub mod cli;
pub mod config;
pub mod listener;
pub mod term_print;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::LevelFilter) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        env_logger::builder()
            .filter_level(override_log_level)
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
