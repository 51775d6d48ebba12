//! Name tables for the numeric constants of `linux/audit.h`.
//!
//! Every enum converts from/to its kernel value (`code`/`from_code`) and
//! from/to the name used by `auditctl` (`FromStr`/`Display`).

use strum::{Display, EnumString, FromRepr, IntoStaticStr};

/// Filter list a rule is attached to (`AUDIT_FILTER_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, FromRepr)]
#[repr(u32)]
pub enum FilterList {
    #[default]
    #[strum(serialize = "user")]
    User = 0x00,
    #[strum(serialize = "task")]
    Task = 0x01,
    #[strum(serialize = "entry")]
    Entry = 0x02,
    #[strum(serialize = "watch")]
    Watch = 0x03,
    #[strum(serialize = "exit")]
    Exit = 0x04,
    #[strum(serialize = "exclude")]
    Exclude = 0x05,
    #[strum(serialize = "filesystem")]
    Filesystem = 0x06,
    #[strum(serialize = "io_uring")]
    UringExit = 0x07,
}

impl FilterList {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }
}

/// What happens when a rule matches (`AUDIT_NEVER`, `AUDIT_POSSIBLE`, `AUDIT_ALWAYS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, FromRepr)]
#[repr(u32)]
pub enum Action {
    #[default]
    #[strum(serialize = "never")]
    Never = 0,
    #[strum(serialize = "possible")]
    Possible = 1,
    #[strum(serialize = "always")]
    Always = 2,
}

impl Action {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }
}

/// Comparison operator of a field predicate, stored in `fieldflags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr, IntoStaticStr)]
#[repr(u32)]
pub enum Operator {
    #[strum(serialize = "&")]
    BitMask = 0x0800_0000,
    #[strum(serialize = "<")]
    LessThan = 0x1000_0000,
    #[strum(serialize = ">")]
    GreaterThan = 0x2000_0000,
    #[strum(serialize = "!=")]
    NotEqual = 0x3000_0000,
    #[strum(serialize = "=")]
    Equal = 0x4000_0000,
    #[strum(serialize = "&=")]
    BitTest = 0x4800_0000,
    #[strum(serialize = "<=")]
    LessThanOrEqual = 0x5000_0000,
    #[strum(serialize = ">=")]
    GreaterThanOrEqual = 0x6000_0000,
}

impl Operator {
    /// Operators ordered so that a prefix scan finds the longest symbol first.
    const BY_SYMBOL_LEN: [Operator; 8] = [
        Operator::NotEqual,
        Operator::BitTest,
        Operator::LessThanOrEqual,
        Operator::GreaterThanOrEqual,
        Operator::BitMask,
        Operator::LessThan,
        Operator::GreaterThan,
        Operator::Equal,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }

    pub fn symbol(self) -> &'static str {
        self.into()
    }

    /// Split `name<op>value` on its first operator, as in `-F uid>=1000`.
    pub fn split_expression(expr: &str) -> Option<(&str, Operator, &str)> {
        let start = expr.find(|c: char| matches!(c, '=' | '!' | '<' | '>' | '&'))?;
        let rest = &expr[start..];
        Self::BY_SYMBOL_LEN
            .into_iter()
            .find(|op| rest.starts_with(op.symbol()))
            .map(|op| (&expr[..start], op, &rest[op.symbol().len()..]))
    }
}

/// Rule field (`AUDIT_PID`, `AUDIT_DIR`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr)]
#[repr(u32)]
pub enum Field {
    #[strum(serialize = "pid")]
    Pid = 0,
    #[strum(serialize = "uid")]
    Uid = 1,
    #[strum(serialize = "euid")]
    Euid = 2,
    #[strum(serialize = "suid")]
    Suid = 3,
    #[strum(serialize = "fsuid")]
    Fsuid = 4,
    #[strum(serialize = "gid")]
    Gid = 5,
    #[strum(serialize = "egid")]
    Egid = 6,
    #[strum(serialize = "sgid")]
    Sgid = 7,
    #[strum(serialize = "fsgid")]
    Fsgid = 8,
    #[strum(to_string = "auid", serialize = "loginuid")]
    LoginUid = 9,
    #[strum(serialize = "pers")]
    Personality = 10,
    #[strum(serialize = "arch")]
    Arch = 11,
    #[strum(serialize = "msgtype")]
    MsgType = 12,
    #[strum(serialize = "subj_user")]
    SubjUser = 13,
    #[strum(serialize = "subj_role")]
    SubjRole = 14,
    #[strum(serialize = "subj_type")]
    SubjType = 15,
    #[strum(serialize = "subj_sen")]
    SubjSen = 16,
    #[strum(serialize = "subj_clr")]
    SubjClr = 17,
    #[strum(serialize = "ppid")]
    Ppid = 18,
    #[strum(serialize = "obj_user")]
    ObjUser = 19,
    #[strum(serialize = "obj_role")]
    ObjRole = 20,
    #[strum(serialize = "obj_type")]
    ObjType = 21,
    #[strum(serialize = "obj_lev_low")]
    ObjLevLow = 22,
    #[strum(serialize = "obj_lev_high")]
    ObjLevHigh = 23,
    #[strum(serialize = "loginuid_set")]
    LoginUidSet = 24,
    #[strum(serialize = "sessionid")]
    SessionId = 25,
    #[strum(serialize = "fstype")]
    FsType = 26,
    #[strum(serialize = "devmajor")]
    DevMajor = 100,
    #[strum(serialize = "devminor")]
    DevMinor = 101,
    #[strum(serialize = "inode")]
    Inode = 102,
    #[strum(serialize = "exit")]
    Exit = 103,
    #[strum(serialize = "success")]
    Success = 104,
    #[strum(serialize = "path")]
    Watch = 105,
    #[strum(serialize = "perm")]
    Perm = 106,
    #[strum(serialize = "dir")]
    Dir = 107,
    #[strum(serialize = "filetype")]
    FileType = 108,
    #[strum(serialize = "obj_uid")]
    ObjUid = 109,
    #[strum(serialize = "obj_gid")]
    ObjGid = 110,
    #[strum(serialize = "field_compare")]
    FieldCompare = 111,
    #[strum(serialize = "exe")]
    Exe = 112,
    #[strum(serialize = "saddr_fam")]
    SaddrFam = 113,
    #[strum(serialize = "a0")]
    Arg0 = 200,
    #[strum(serialize = "a1")]
    Arg1 = 201,
    #[strum(serialize = "a2")]
    Arg2 = 202,
    #[strum(serialize = "a3")]
    Arg3 = 203,
    #[strum(serialize = "key")]
    FilterKey = 210,
}

impl Field {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }

    /// Fields whose value lives in the rule's string trailer. For those the
    /// numeric value is the length of the string.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Field::SubjUser
                | Field::SubjRole
                | Field::SubjType
                | Field::SubjSen
                | Field::SubjClr
                | Field::ObjUser
                | Field::ObjRole
                | Field::ObjType
                | Field::ObjLevLow
                | Field::ObjLevHigh
                | Field::Watch
                | Field::Dir
                | Field::FilterKey
                | Field::Exe
        )
    }
}

/// Access permissions of a watch (`AUDIT_PERM_*`).
pub mod perm {
    pub const EXEC: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const READ: u32 = 4;
    pub const ATTR: u32 = 8;
    pub const ALL: u32 = EXEC | WRITE | READ | ATTR;

    /// Parse the `rwxa` notation used by `auditctl -p`.
    pub fn parse(value: &str) -> Option<u32> {
        if value.is_empty() {
            return None;
        }
        value.chars().try_fold(0, |acc, c| {
            let bit = match c {
                'r' => READ,
                'w' => WRITE,
                'x' => EXEC,
                'a' => ATTR,
                _ => return None,
            };
            Some(acc | bit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn field_names() {
        assert_eq!(Field::from_str("dir"), Ok(Field::Dir));
        assert_eq!(Field::from_str("loginuid"), Ok(Field::LoginUid));
        assert_eq!(Field::from_code(210), Some(Field::FilterKey));
        assert_eq!(Field::FilterKey.to_string(), "key");
        assert!(Field::from_str("nope").is_err());
        assert!(Field::Dir.is_string());
        assert!(!Field::Arch.is_string());
    }

    #[test]
    fn operator_codes() {
        assert_eq!(Operator::Equal.code(), 0x4000_0000);
        assert_eq!(
            Operator::BitTest.code(),
            Operator::BitMask.code() | Operator::Equal.code()
        );
        assert_eq!(Operator::from_str("!="), Ok(Operator::NotEqual));
        assert_eq!(Operator::from_code(0x5000_0000), Some(Operator::LessThanOrEqual));
    }

    #[test]
    fn split_expression() {
        assert_eq!(
            Operator::split_expression("uid>=1000"),
            Some(("uid", Operator::GreaterThanOrEqual, "1000"))
        );
        assert_eq!(
            Operator::split_expression("exit!=0"),
            Some(("exit", Operator::NotEqual, "0"))
        );
        assert_eq!(
            Operator::split_expression("dir=/tmp"),
            Some(("dir", Operator::Equal, "/tmp"))
        );
        assert_eq!(Operator::split_expression("uid"), None);
    }

    #[test]
    fn filter_and_action() {
        assert_eq!(FilterList::from_str("exit"), Ok(FilterList::Exit));
        assert_eq!(FilterList::Exit.code(), 4);
        assert_eq!(Action::from_str("always"), Ok(Action::Always));
        assert_eq!(Action::from_code(2), Some(Action::Always));
    }

    #[test]
    fn parse_perm() {
        assert_eq!(perm::parse("rwxa"), Some(perm::ALL));
        assert_eq!(perm::parse("w"), Some(perm::WRITE));
        assert_eq!(perm::parse("rz"), None);
        assert_eq!(perm::parse(""), None);
    }
}
