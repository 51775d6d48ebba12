//! Syscall numbering strategies.
//!
//! The same syscall name maps to different numbers depending on the calling
//! convention of the monitored process, and the kernel only evaluates a
//! rule's syscall bitmap for the architecture named by the rule. An [`Abi`]
//! owns both decisions: name resolution and the predicates a rule needs the
//! first time a syscall is selected.

use std::collections::HashMap;

use lazy_static::lazy_static;
use nix::sys::utsname::uname;

use crate::{Field, Operator, Predicate, RuleError};

#[path = "platform/aarch64.rs"]
mod aarch64;
#[path = "platform/i386.rs"]
mod i386;
#[path = "platform/x86_64.rs"]
mod x86_64;

/// `AUDIT_ARCH_*` values from `linux/audit.h`.
pub mod arch {
    pub const X86_64: u32 = 0xc000_003e;
    pub const I386: u32 = 0x4000_0003;
    pub const AARCH64: u32 = 0xc000_00b7;
    pub const ARM: u32 = 0x4000_0028;
}

lazy_static! {
    static ref X86_64_BY_NAME: HashMap<&'static str, u32> = by_name(x86_64::SYSCALLS);
    static ref I386_BY_NAME: HashMap<&'static str, u32> = by_name(i386::SYSCALLS);
    static ref AARCH64_BY_NAME: HashMap<&'static str, u32> = by_name(aarch64::SYSCALLS);
}

fn by_name(table: &'static [(u32, &'static str)]) -> HashMap<&'static str, u32> {
    table.iter().map(|(nr, name)| (*name, *nr)).collect()
}

/// Pluggable syscall numbering used by [`crate::RuleBuilder`].
pub trait Abi {
    /// Short name, as used by `auditctl -F arch=`.
    fn name(&self) -> &'static str;

    /// Resolve a syscall name to its number.
    fn lookup(&self, name: &str) -> Option<u32>;

    /// Resolve a syscall number to its name.
    fn syscall_name(&self, nr: u32) -> Option<&'static str>;

    /// Resolve an `arch=` value such as `b32`, `b64` or a machine name to
    /// its `AUDIT_ARCH_*` code.
    fn arch_value(&self, name: &str) -> Option<u32>;

    /// Predicates appended the first time a rule selects a syscall. They
    /// tell the kernel which numbering the bitmap refers to.
    fn mask_predicates(&self) -> Vec<Predicate>;
}

/// Architectures with a built-in syscall table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    X86_64,
    I386,
    Aarch64,
}

impl Machine {
    /// Detect the machine of the running kernel.
    pub fn detect() -> Result<Self, RuleError> {
        let info = uname().map_err(RuleError::DetectMachine)?;
        let machine = info.machine().to_string_lossy();
        Self::from_uname(&machine).ok_or_else(|| RuleError::UnsupportedMachine(machine.into()))
    }

    fn from_uname(machine: &str) -> Option<Self> {
        match machine {
            "x86_64" => Some(Machine::X86_64),
            "i386" | "i486" | "i586" | "i686" => Some(Machine::I386),
            "aarch64" | "arm64" => Some(Machine::Aarch64),
            _ => None,
        }
    }

    /// `AUDIT_ARCH_*` value of this machine.
    pub fn audit_arch(self) -> u32 {
        match self {
            Machine::X86_64 => arch::X86_64,
            Machine::I386 => arch::I386,
            Machine::Aarch64 => arch::AARCH64,
        }
    }

    fn table(self) -> &'static [(u32, &'static str)] {
        match self {
            Machine::X86_64 => x86_64::SYSCALLS,
            Machine::I386 => i386::SYSCALLS,
            Machine::Aarch64 => aarch64::SYSCALLS,
        }
    }

    fn by_name(self) -> &'static HashMap<&'static str, u32> {
        match self {
            Machine::X86_64 => &X86_64_BY_NAME,
            Machine::I386 => &I386_BY_NAME,
            Machine::Aarch64 => &AARCH64_BY_NAME,
        }
    }
}

impl Abi for Machine {
    fn name(&self) -> &'static str {
        match self {
            Machine::X86_64 | Machine::Aarch64 => "b64",
            Machine::I386 => "b32",
        }
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name().get(name).copied()
    }

    fn syscall_name(&self, nr: u32) -> Option<&'static str> {
        let table = self.table();
        table
            .binary_search_by_key(&nr, |(nr, _)| *nr)
            .ok()
            .map(|index| table[index].1)
    }

    fn arch_value(&self, name: &str) -> Option<u32> {
        let value = match (self, name) {
            (Machine::X86_64 | Machine::I386, "b64") => arch::X86_64,
            (Machine::X86_64 | Machine::I386, "b32") => arch::I386,
            (Machine::Aarch64, "b64") => arch::AARCH64,
            (Machine::Aarch64, "b32") => arch::ARM,
            _ => Machine::from_uname(name)?.audit_arch(),
        };
        Some(value)
    }

    fn mask_predicates(&self) -> Vec<Predicate> {
        vec![Predicate::numeric(
            Field::Arch,
            Operator::Equal,
            self.audit_arch(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_machine() {
        assert_eq!(Machine::X86_64.lookup("mkdir"), Some(83));
        assert_eq!(Machine::I386.lookup("mkdir"), Some(39));
        // asm-generic has no plain mkdir
        assert_eq!(Machine::Aarch64.lookup("mkdir"), None);
        assert_eq!(Machine::Aarch64.lookup("mkdirat"), Some(34));
        assert_eq!(Machine::X86_64.lookup("not_a_syscall"), None);
    }

    #[test]
    fn reverse_lookup() {
        assert_eq!(Machine::X86_64.syscall_name(0), Some("read"));
        assert_eq!(Machine::X86_64.syscall_name(83), Some("mkdir"));
        assert_eq!(Machine::X86_64.syscall_name(100_000), None);
    }

    #[test]
    fn tables_are_sorted() {
        for machine in [Machine::X86_64, Machine::I386, Machine::Aarch64] {
            let table = machine.table();
            assert!(table.windows(2).all(|pair| pair[0].0 < pair[1].0));
        }
    }

    #[test]
    fn uname_machines() {
        assert_eq!(Machine::from_uname("x86_64"), Some(Machine::X86_64));
        assert_eq!(Machine::from_uname("i686"), Some(Machine::I386));
        assert_eq!(Machine::from_uname("aarch64"), Some(Machine::Aarch64));
        assert_eq!(Machine::from_uname("sparc"), None);
    }

    #[test]
    fn arch_names() {
        assert_eq!(Machine::X86_64.arch_value("b64"), Some(arch::X86_64));
        assert_eq!(Machine::X86_64.arch_value("b32"), Some(arch::I386));
        assert_eq!(Machine::I386.arch_value("b64"), Some(arch::X86_64));
        assert_eq!(Machine::Aarch64.arch_value("b32"), Some(arch::ARM));
        assert_eq!(Machine::X86_64.arch_value("aarch64"), Some(arch::AARCH64));
        assert_eq!(Machine::X86_64.arch_value("b16"), None);
    }

    #[test]
    fn mask_predicate_names_the_arch() {
        let predicates = Machine::X86_64.mask_predicates();
        assert_eq!(predicates.len(), 1);
        assert_eq!(predicates[0].field(), Field::Arch);
        assert_eq!(predicates[0].value(), arch::X86_64);
    }
}
