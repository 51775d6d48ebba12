//! [`AuditRule`] mirrors `struct audit_rule_data` from `linux/audit.h`:
//!
//! ```text
//! u32 flags, action, field_count
//! u32 mask[64]
//! u32 fields[64], values[64], fieldflags[64]
//! u32 buflen
//! u8  buf[buflen]
//! ```
//!
//! The kernel matches predicates positionally, so insertion order is wire
//! order. The three parallel arrays are kept as a single list of
//! [`Predicate`]s and only split apart when serializing.

use std::{fmt, mem::size_of, os::unix::ffi::OsStrExt, path::Path};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Abi, Action, Field, FilterList, Machine, Operator, RuleError, perm};

/// `AUDIT_MAX_FIELDS`
pub const MAX_FIELDS: usize = 64;
/// `AUDIT_BITMASK_SIZE`, in 32 bit words
pub const BITMASK_SIZE: usize = 64;
/// Syscall numbers must be below this to fit the bitmap.
pub const MAX_SYSCALLS: u32 = (BITMASK_SIZE * 32) as u32;
/// `MAX_AUDIT_MESSAGE_LENGTH`, including the netlink header.
pub const MAX_MESSAGE_LENGTH: usize = 8970;
/// `AUDIT_MAX_KEY_LEN`
pub const MAX_KEY_LEN: usize = 256;
pub const PATH_MAX: usize = 4096;
/// Size of the fixed part of `struct audit_rule_data`.
pub const HEADER_SIZE: usize = size_of::<u32>() * (3 + BITMASK_SIZE + 3 * MAX_FIELDS + 1);
/// Room left for the string trailer in a single netlink message.
pub const MAX_BUFLEN: usize = MAX_MESSAGE_LENGTH - NLMSG_HDRLEN - HEADER_SIZE;

const NLMSG_HDRLEN: usize = 16;

/// One `(field, operator, value)` triple.
///
/// For string fields the value is the byte length of the string stored in
/// the rule trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
    field: Field,
    operator: Operator,
    value: u32,
}

impl Predicate {
    pub fn numeric(field: Field, operator: Operator, value: u32) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRule {
    flags: FilterList,
    action: Action,
    mask: [u32; BITMASK_SIZE],
    predicates: Vec<Predicate>,
    buf: Vec<u8>,
}

impl Default for AuditRule {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRule {
    /// An empty, zeroed rule.
    pub fn new() -> Self {
        Self {
            flags: FilterList::default(),
            action: Action::default(),
            mask: [0; BITMASK_SIZE],
            predicates: Vec::with_capacity(MAX_FIELDS),
            buf: Vec::new(),
        }
    }

    pub fn flags(&self) -> FilterList {
        self.flags
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn field_count(&self) -> usize {
        self.predicates.len()
    }

    pub fn mask(&self) -> &[u32; BITMASK_SIZE] {
        &self.mask
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// The `fields[]` array, truncated to `field_count`.
    pub fn fields(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.predicates.iter().map(|p| p.field.code())
    }

    /// The `fieldflags[]` array, truncated to `field_count`.
    pub fn field_flags(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.predicates.iter().map(|p| p.operator.code())
    }

    /// The `values[]` array, truncated to `field_count`.
    pub fn values(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.predicates.iter().map(|p| p.value)
    }

    pub fn buflen(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Raw string trailer.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn has_syscall(&self, nr: u32) -> bool {
        nr < MAX_SYSCALLS && self.mask[mask_word(nr)] & mask_bit(nr) != 0
    }

    /// Selected syscall numbers, in ascending order.
    pub fn syscalls(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_SYSCALLS).filter(|nr| self.has_syscall(*nr))
    }

    pub fn selects_all_syscalls(&self) -> bool {
        self.mask.iter().all(|word| *word == u32::MAX)
    }

    /// String-valued predicates paired with their slice of the trailer.
    /// Each string starts where the previous one ended.
    pub fn strings(&self) -> impl Iterator<Item = (Field, &[u8])> + '_ {
        let mut offset = 0;
        self.predicates
            .iter()
            .filter(|p| p.field.is_string())
            .map(move |p| {
                let start = offset.min(self.buf.len());
                let end = (offset + p.value as usize).min(self.buf.len());
                offset += p.value as usize;
                (p.field, &self.buf[start..end])
            })
    }

    /// Copy of this rule targeting another filter list and action.
    pub fn with_target(&self, flags: FilterList, action: Action) -> AuditRule {
        AuditRule {
            flags,
            action,
            ..self.clone()
        }
    }

    /// Encode in native byte order. Array entries past `field_count` are zero.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.buf.len());
        out.put_u32_ne(self.flags.code());
        out.put_u32_ne(self.action.code());
        out.put_u32_ne(self.field_count() as u32);
        for word in self.mask {
            out.put_u32_ne(word);
        }
        put_padded(&mut out, self.fields());
        put_padded(&mut out, self.values());
        put_padded(&mut out, self.field_flags());
        out.put_u32_ne(self.buflen());
        out.put_slice(&self.buf);
        out.freeze()
    }

    /// Decode a buffer produced by [`AuditRule::serialize`] or sent by the
    /// kernel in an `AUDIT_LIST_RULES` reply.
    pub fn parse(mut data: &[u8]) -> Result<AuditRule, RuleError> {
        let len = data.len();
        if len < HEADER_SIZE {
            return Err(RuleError::Truncated {
                expected: HEADER_SIZE,
                len,
            });
        }
        let flags = data.get_u32_ne();
        let flags = FilterList::from_code(flags).ok_or(RuleError::UnknownCode {
            kind: "filter list",
            code: flags,
        })?;
        let action = data.get_u32_ne();
        let action = Action::from_code(action).ok_or(RuleError::UnknownCode {
            kind: "action",
            code: action,
        })?;
        let field_count = data.get_u32_ne() as usize;
        if field_count > MAX_FIELDS {
            return Err(RuleError::TooManyFields);
        }
        let mut mask = [0; BITMASK_SIZE];
        mask.iter_mut().for_each(|word| *word = data.get_u32_ne());
        let fields = get_array(&mut data);
        let values = get_array(&mut data);
        let field_flags = get_array(&mut data);
        let buflen = data.get_u32_ne() as usize;
        if data.remaining() < buflen {
            return Err(RuleError::Truncated {
                expected: HEADER_SIZE + buflen,
                len,
            });
        }

        let predicates = (0..field_count)
            .map(|i| {
                let field = Field::from_code(fields[i]).ok_or(RuleError::UnknownCode {
                    kind: "field",
                    code: fields[i],
                })?;
                let operator =
                    Operator::from_code(field_flags[i]).ok_or(RuleError::UnknownCode {
                        kind: "operator",
                        code: field_flags[i],
                    })?;
                Ok(Predicate::numeric(field, operator, values[i]))
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        let claimed: usize = predicates
            .iter()
            .filter(|p| p.field.is_string())
            .map(|p| p.value as usize)
            .sum();
        if claimed != buflen {
            return Err(RuleError::StringTableMismatch { claimed, buflen });
        }

        Ok(AuditRule {
            flags,
            action,
            mask,
            predicates,
            buf: data[..buflen].to_vec(),
        })
    }

    fn fmt_with(
        &self,
        f: &mut fmt::Formatter<'_>,
        syscall_name: impl Fn(u32) -> Option<&'static str>,
    ) -> fmt::Result {
        write!(f, "-a {},{}", self.action, self.flags)?;
        if self.selects_all_syscalls() {
            write!(f, " -S all")?;
        } else {
            for nr in self.syscalls() {
                match syscall_name(nr) {
                    Some(name) => write!(f, " -S {name}")?,
                    None => write!(f, " -S {nr}")?,
                }
            }
        }
        let mut strings = self.strings();
        for predicate in &self.predicates {
            write!(f, " -F {}{}", predicate.field, predicate.operator)?;
            if predicate.field.is_string() {
                let (_, value) = strings.next().unwrap_or((predicate.field, &b""[..]));
                write!(f, "{}", String::from_utf8_lossy(value))?;
            } else if predicate.field == Field::Arch {
                write!(f, "{:#x}", predicate.value)?;
            } else {
                write!(f, "{}", predicate.value)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for AuditRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, |_| None)
    }
}

fn mask_word(nr: u32) -> usize {
    (nr / 32) as usize
}

fn mask_bit(nr: u32) -> u32 {
    1 << (nr % 32)
}

fn put_padded(out: &mut BytesMut, items: impl ExactSizeIterator<Item = u32>) {
    let unused = MAX_FIELDS - items.len();
    items.for_each(|item| out.put_u32_ne(item));
    out.put_bytes(0, unused * size_of::<u32>());
}

fn get_array(data: &mut &[u8]) -> [u32; MAX_FIELDS] {
    let mut out = [0; MAX_FIELDS];
    out.iter_mut().for_each(|item| *item = data.get_u32_ne());
    out
}

/// Builds an [`AuditRule`] one predicate at a time.
///
/// Every operation is additive and either applies completely or leaves the
/// rule untouched.
#[derive(Debug)]
pub struct RuleBuilder<A = Machine> {
    rule: AuditRule,
    abi: A,
}

impl RuleBuilder<Machine> {
    /// Builder using the syscall numbering of the running kernel.
    pub fn native() -> Result<Self, RuleError> {
        Ok(Self::new(Machine::detect()?))
    }
}

impl<A: Abi> RuleBuilder<A> {
    pub fn new(abi: A) -> Self {
        Self {
            rule: AuditRule::new(),
            abi,
        }
    }

    pub fn abi(&self) -> &A {
        &self.abi
    }

    pub fn rule(&self) -> &AuditRule {
        &self.rule
    }

    pub fn build(self) -> AuditRule {
        self.rule
    }

    pub fn serialize(&self) -> Bytes {
        self.rule.serialize()
    }

    pub fn filter_list(&mut self, flags: FilterList) -> &mut Self {
        self.rule.flags = flags;
        self
    }

    pub fn action(&mut self, action: Action) -> &mut Self {
        self.rule.action = action;
        self
    }

    /// Select a syscall by name. The name `all` selects every syscall.
    pub fn add_syscall_by_name(&mut self, name: &str) -> Result<(), RuleError> {
        if name == "all" {
            return self.add_all_syscalls();
        }
        let nr = self
            .abi
            .lookup(name)
            .ok_or_else(|| RuleError::UnknownSyscall {
                name: name.to_string(),
                abi: self.abi.name(),
            })?;
        self.add_syscall(nr)
    }

    /// Select a syscall by number.
    pub fn add_syscall(&mut self, nr: u32) -> Result<(), RuleError> {
        if nr >= MAX_SYSCALLS {
            return Err(RuleError::SyscallOutOfRange(nr));
        }
        self.activate_mask()?;
        self.rule.mask[mask_word(nr)] |= mask_bit(nr);
        Ok(())
    }

    pub fn add_all_syscalls(&mut self) -> Result<(), RuleError> {
        self.activate_mask()?;
        self.rule.mask = [u32::MAX; BITMASK_SIZE];
        Ok(())
    }

    /// The first selected syscall brings in the ABI predicates.
    fn activate_mask(&mut self) -> Result<(), RuleError> {
        if self.rule.mask.iter().any(|word| *word != 0) {
            return Ok(());
        }
        let missing: Vec<Predicate> = self
            .abi
            .mask_predicates()
            .into_iter()
            .filter(|p| !self.rule.predicates.iter().any(|q| q.field == p.field))
            .collect();
        if self.rule.field_count() + missing.len() > MAX_FIELDS {
            return Err(RuleError::TooManyFields);
        }
        self.rule.predicates.extend(missing);
        Ok(())
    }

    /// Append a numeric predicate.
    pub fn add_field_filter(
        &mut self,
        field: Field,
        operator: Operator,
        value: u32,
    ) -> Result<(), RuleError> {
        if field.is_string() {
            return Err(RuleError::StringField(field));
        }
        self.push(Predicate::numeric(field, operator, value))
    }

    /// Append a string predicate; the string goes to the trailer.
    pub fn add_string_filter(
        &mut self,
        field: Field,
        operator: Operator,
        value: &str,
    ) -> Result<(), RuleError> {
        if !field.is_string() {
            return Err(RuleError::NumericField(field));
        }
        let max = if field == Field::FilterKey {
            MAX_KEY_LEN
        } else {
            PATH_MAX
        };
        if value.len() > max || self.rule.buf.len() + value.len() > MAX_BUFLEN {
            return Err(RuleError::StringTooLong {
                field,
                len: value.len(),
                max: max.min(MAX_BUFLEN - self.rule.buf.len()),
            });
        }
        self.push_string(field, operator, value.as_bytes())
    }

    /// Append a predicate written as `name<op>value`, e.g. `uid>=1000`.
    pub fn add_field_expr(&mut self, expr: &str) -> Result<(), RuleError> {
        let (name, operator, value) = Operator::split_expression(expr)
            .ok_or_else(|| RuleError::InvalidExpression(expr.to_string()))?;
        let field: Field = name
            .parse()
            .map_err(|_| RuleError::UnknownField(name.to_string()))?;
        if field.is_string() {
            return self.add_string_filter(field, operator, value);
        }
        let value = match field {
            Field::Arch => self.abi.arch_value(value).or_else(|| parse_number(value)),
            Field::Perm => perm::parse(value),
            _ => parse_number(value),
        }
        .ok_or_else(|| RuleError::InvalidValue {
            field,
            value: value.to_string(),
        })?;
        self.add_field_filter(field, operator, value)
    }

    /// Watch a directory tree (`dir` field).
    pub fn add_watch_path(&mut self, path: impl AsRef<Path>) -> Result<(), RuleError> {
        self.add_watch(Field::Dir, path.as_ref())
    }

    /// Watch a single file (`path` field).
    pub fn add_file_watch(&mut self, path: impl AsRef<Path>) -> Result<(), RuleError> {
        self.add_watch(Field::Watch, path.as_ref())
    }

    fn add_watch(&mut self, field: Field, path: &Path) -> Result<(), RuleError> {
        if !path.is_absolute() {
            return Err(RuleError::RelativePath(path.display().to_string()));
        }
        let mut bytes = path.as_os_str().as_bytes();
        while bytes.len() > 1 && bytes.ends_with(b"/") {
            bytes = &bytes[..bytes.len() - 1];
        }
        let room = MAX_BUFLEN - self.rule.buf.len();
        if bytes.len() > PATH_MAX || bytes.len() > room {
            return Err(RuleError::PathTooLong {
                len: bytes.len(),
                max: PATH_MAX.min(room),
            });
        }
        self.push_string(field, Operator::Equal, bytes)
    }

    /// Restrict a watch to some access types (`perm` field).
    pub fn add_watch_perms(&mut self, perms: u32) -> Result<(), RuleError> {
        if perms == 0 || perms & !perm::ALL != 0 {
            return Err(RuleError::InvalidValue {
                field: Field::Perm,
                value: perms.to_string(),
            });
        }
        self.add_field_filter(Field::Perm, Operator::Equal, perms)
    }

    /// Tag records generated by this rule (`key` field).
    pub fn add_key(&mut self, key: &str) -> Result<(), RuleError> {
        self.add_string_filter(Field::FilterKey, Operator::Equal, key)
    }

    fn push(&mut self, predicate: Predicate) -> Result<(), RuleError> {
        if self.rule.field_count() == MAX_FIELDS {
            return Err(RuleError::TooManyFields);
        }
        self.rule.predicates.push(predicate);
        Ok(())
    }

    fn push_string(
        &mut self,
        field: Field,
        operator: Operator,
        bytes: &[u8],
    ) -> Result<(), RuleError> {
        self.push(Predicate::numeric(field, operator, bytes.len() as u32))?;
        self.rule.buf.extend_from_slice(bytes);
        log::trace!("stored {} bytes for {field}, buflen {}", bytes.len(), self.rule.buflen());
        Ok(())
    }
}

impl<A: Abi> fmt::Display for RuleBuilder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.rule.fmt_with(f, |nr| self.abi.syscall_name(nr))
    }
}

/// Decimal, `0x` hexadecimal or negative (two's complement, as for `exit=-13`).
fn parse_number(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else if value.starts_with('-') {
        value.parse::<i32>().ok().map(|v| v as u32)
    } else {
        value.parse().ok()
    }
}
