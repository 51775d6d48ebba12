//! Construction and wire encoding of Linux audit filter rules.
//!
//! A [`RuleBuilder`] collects syscall selections, field predicates and watch
//! paths into an [`AuditRule`], which serializes to the `audit_rule_data`
//! layout expected by `AUDIT_ADD_RULE`/`AUDIT_DEL_RULE` requests.
//!
//! ```no_run
//! use audit_rule::{Action, FilterList, RuleBuilder};
//!
//! let mut builder = RuleBuilder::native()?;
//! builder.filter_list(FilterList::Exit).action(Action::Always);
//! builder.add_syscall_by_name("mkdir")?;
//! builder.add_watch_path("/home/user/watched")?;
//! let payload = builder.serialize();
//! # Ok::<(), audit_rule::RuleError>(())
//! ```

pub mod abi;
mod field;
mod rule;

use thiserror::Error;

pub use abi::{Abi, Machine};
pub use field::{Action, Field, FilterList, Operator, perm};
pub use rule::{
    AuditRule, BITMASK_SIZE, HEADER_SIZE, MAX_BUFLEN, MAX_FIELDS, MAX_KEY_LEN,
    MAX_MESSAGE_LENGTH, MAX_SYSCALLS, PATH_MAX, Predicate, RuleBuilder,
};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("unknown syscall {name} for {abi}")]
    UnknownSyscall { name: String, abi: &'static str },
    #[error("syscall number {0} does not fit the rule bitmap")]
    SyscallOutOfRange(u32),
    #[error("rule already has {max} fields", max = MAX_FIELDS)]
    TooManyFields,
    #[error("path of {len} bytes does not fit the rule (max {max})")]
    PathTooLong { len: usize, max: usize },
    #[error("watch path {0} is not absolute")]
    RelativePath(String),
    #[error("value of {len} bytes for {field} does not fit the rule (max {max})")]
    StringTooLong { field: Field, len: usize, max: usize },
    #[error("field {0} takes a string value")]
    StringField(Field),
    #[error("field {0} takes a numeric value")]
    NumericField(Field),
    #[error("unknown field {0}")]
    UnknownField(String),
    #[error("invalid field expression {0}")]
    InvalidExpression(String),
    #[error("invalid value {value} for field {field}")]
    InvalidValue { field: Field, value: String },
    #[error("rule buffer truncated: expected {expected} bytes, got {len}")]
    Truncated { expected: usize, len: usize },
    #[error("unknown {kind} {code:#x} in rule buffer")]
    UnknownCode { kind: &'static str, code: u32 },
    #[error("string fields claim {claimed} bytes but the trailer has {buflen}")]
    StringTableMismatch { claimed: usize, buflen: usize },
    #[error("detecting machine type failed")]
    DetectMachine(#[source] nix::Error),
    #[error("unsupported machine {0}")]
    UnsupportedMachine(String),
}
