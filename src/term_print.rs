use anyhow::Result;
use audit_channel::{AuditStatus, DecodedEvent};
use audit_rule::{Abi, RuleBuilder};
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl<A: Abi> TermPrintable for RuleBuilder<A> {
    fn term_print(&self) -> Result<TermPrinted> {
        let rule = self.rule();
        let mut table = table();

        table.set_header(vec![
            Cell::new("FIELD").add_attribute(Attribute::Bold),
            Cell::new("OP").add_attribute(Attribute::Bold),
            Cell::new("VALUE").add_attribute(Attribute::Bold),
        ]);

        let syscalls = if rule.selects_all_syscalls() {
            "all".to_string()
        } else {
            rule.syscalls()
                .map(|nr| match self.abi().syscall_name(nr) {
                    Some(name) => name.to_string(),
                    None => nr.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        if !syscalls.is_empty() {
            table.add_row(vec![
                Cell::new("syscall").fg(Color::Cyan).add_attribute(Attribute::Bold),
                Cell::new(""),
                Cell::new(syscalls),
            ]);
        }

        let mut strings = rule.strings();
        for predicate in rule.predicates() {
            let value = if predicate.field().is_string() {
                strings
                    .next()
                    .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
                    .unwrap_or_default()
            } else {
                predicate.value().to_string()
            };
            table.add_row(vec![
                Cell::new(predicate.field()).fg(Color::Cyan).add_attribute(Attribute::Bold),
                Cell::new(predicate.operator().symbol()),
                Cell::new(value),
            ]);
        }

        println!("{} {}", rule.action(), rule.flags());
        println!("{table}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for AuditStatus {
    fn term_print(&self) -> Result<TermPrinted> {
        let mut table = table();

        table.set_header(vec![
            Cell::new("STATUS").add_attribute(Attribute::Bold),
            Cell::new("VALUE").add_attribute(Attribute::Bold),
        ]);

        let enabled_color = if self.is_enabled() {
            Color::Green
        } else {
            Color::Red
        };
        table.add_row(vec![
            Cell::new("enabled"),
            Cell::new(self.enabled)
                .fg(enabled_color)
                .add_attribute(Attribute::Bold),
        ]);
        for (name, value) in [
            ("pid", self.pid),
            ("backlog", self.backlog),
            ("backlog_limit", self.backlog_limit),
            ("lost", self.lost),
            ("rate_limit", self.rate_limit),
        ] {
            table.add_row(vec![Cell::new(name), Cell::new(value)]);
        }

        println!("{table}");
        Ok(TermPrinted)
    }
}

pub fn print_event(event: &DecodedEvent) {
    println!("{event}");
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
