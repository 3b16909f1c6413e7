//! CAPI command handlers, one module per command family.
use crate::dispatch::CommandTable;
use crate::proto::command::Command;

pub mod basic;
pub mod dev;
pub mod ip;
pub mod miracast;
pub mod p2p;
pub mod server;
pub mod sta;

/// Every supported command.
pub fn build_table() -> CommandTable {
    let mut t = CommandTable::new();
    basic::register(&mut t);
    dev::register(&mut t);
    sta::register(&mut t);
    ip::register(&mut t);
    p2p::register(&mut t);
    miracast::register(&mut t);
    server::register(&mut t);
    t
}

pub fn has_interface(c: &Command) -> bool {
    c.has("interface")
}

#[cfg(test)]
pub mod testing {
    use crate::dispatch::{Reply, process_line};
    use crate::dut::Dut;

    /// Run one command line through the full table; returns what went on the wire.
    pub fn run(dut: &mut Dut, line: &str) -> String {
        let table = super::build_table();
        let mut out = Vec::new();
        let mut reply = Reply::new(&mut out, None);
        process_line(dut, &table, &mut reply, line);
        String::from_utf8(out).unwrap_or_default()
    }

    /// The terminal line of `run`, without CRLF.
    pub fn last(dut: &mut Dut, line: &str) -> String {
        let out = run(dut, line);
        out.lines().last().unwrap_or_default().to_string()
    }
}
