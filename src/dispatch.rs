use anyhow::Result;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, info, warn};

use crate::dut::Dut;
use crate::logging::SummaryLog;
use crate::proto::command::{CmdResult, Command, Status};
use crate::proto::parser::{format_response, parse_command, trim_line};

/// Longest `NOTE` forwarded to the supplicant log.
const NOTE_MAX: usize = 199;

pub type Validator = fn(&Command) -> bool;
pub type Processor = fn(&mut Dut, &mut Reply<'_>, &Command) -> Result<CmdResult>;

pub struct Handler {
    pub validate: Option<Validator>,
    pub process: Processor,
}

/// Command name (case-insensitive) to handler.
#[derive(Default)]
pub struct CommandTable {
    map: HashMap<String, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, validate: Option<Validator>, process: Processor) {
        if self
            .map
            .insert(name.to_ascii_lowercase(), Handler { validate, process })
            .is_some()
        {
            debug!("command {} registered again, replacing", name);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Handler> {
        self.map.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Response channel of one connection.
pub struct Reply<'a> {
    out: &'a mut dyn Write,
    summary: Option<&'a SummaryLog>,
    terminal: usize,
}

impl<'a> Reply<'a> {
    pub fn new(out: &'a mut dyn Write, summary: Option<&'a SummaryLog>) -> Self {
        Self {
            out,
            summary,
            terminal: 0,
        }
    }

    /// Write one status line. An empty payload is sent as none.
    pub fn send(&mut self, status: Status, payload: Option<&str>) {
        let payload = payload.filter(|p| !p.is_empty());
        let line = format_response(status, payload);
        info!("resp: {}", line.trim_end());
        if status.is_terminal() {
            self.terminal += 1;
            if let Some(s) = self.summary {
                s.line(&format!("CAPI resp: {}", line.trim_end()));
            }
        }
        if let Err(e) = self.out.write_all(line.as_bytes()).and_then(|_| self.out.flush()) {
            warn!("send: {}", e);
        }
    }

    pub fn complete(&mut self, payload: &str) -> CmdResult {
        self.send(Status::Complete, Some(payload));
        CmdResult::StatusSent
    }

    pub fn error(&mut self, payload: &str) -> CmdResult {
        self.send(Status::Error, Some(payload));
        CmdResult::StatusSentError
    }

    pub fn invalid(&mut self, payload: &str) -> CmdResult {
        self.send(Status::Invalid, Some(payload));
        CmdResult::StatusSentError
    }

    fn summary_line(&self, text: &str) {
        if let Some(s) = self.summary {
            s.line(text);
        }
    }
}

/// `NOTE` request for the supplicant log, cut on a char boundary to fit its
/// byte buffer.
pub fn capi_note(text: &str) -> String {
    let mut note = format!("NOTE CAPI:{}", text);
    if note.len() > NOTE_MAX {
        let mut end = NOTE_MAX;
        while !note.is_char_boundary(end) {
            end -= 1;
        }
        note.truncate(end);
    }
    note
}

/// Handle one received command line end to end.
pub fn process_line(dut: &mut Dut, table: &CommandTable, reply: &mut Reply<'_>, raw: &str) {
    let line = trim_line(raw);
    if line.is_empty() {
        // Split CRLF pairs across reads leave empty lines behind.
        debug!("ignoring empty line");
        return;
    }
    info!("cmd: {}", line);
    reply.summary_line(&format!("CAPI cmd: {}", line));

    let main = dut.env.main_ifname();
    let _ = dut.ctrl().request(&main, &capi_note(line));

    let cmd = match parse_command(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            info!("Invalid command: {}", e);
            reply.send(Status::Invalid, Some("errorCode,Invalid parameters"));
            return;
        }
    };
    let Some(handler) = table.lookup(&cmd.name) else {
        info!("Unknown command: {}", cmd.name);
        reply.send(Status::Invalid, Some("errorCode,Unknown command"));
        return;
    };
    if let Some(validate) = handler.validate
        && !validate(&cmd)
    {
        reply.send(Status::Invalid, Some("errorCode,Invalid parameters"));
        return;
    }

    reply.send(Status::Running, None);
    let before = reply.terminal;
    match (handler.process)(dut, reply, &cmd) {
        Ok(CmdResult::Error) => reply.send(Status::Error, None),
        Ok(CmdResult::Invalid) => reply.send(Status::Invalid, None),
        Ok(CmdResult::Success) => reply.send(Status::Complete, None),
        Ok(CmdResult::StatusSent | CmdResult::StatusSentError) => {}
        Err(e) => {
            warn!("{}: {:#}", cmd.name, e);
            let msg = format!("{:#}", e).replace([',', '\r', '\n'], " ");
            reply.send(Status::Error, Some(&format!("errorCode,{}", msg)));
        }
    }
    let sent = reply.terminal - before;
    if sent != 1 {
        warn!("{} sent {} terminal responses", cmd.name, sent);
    }
}
