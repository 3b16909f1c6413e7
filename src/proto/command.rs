use std::fmt;

/// Status word of a CAPI response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Invalid,
    Error,
    Complete,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Running => "RUNNING",
            Status::Invalid => "INVALID",
            Status::Error => "ERROR",
            Status::Complete => "COMPLETE",
        }
    }

    /// Everything except RUNNING ends a command.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a command processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdResult {
    /// Dispatcher replies `status,ERROR`
    Error,
    /// Dispatcher replies `status,INVALID`
    Invalid,
    /// Dispatcher replies `status,COMPLETE`
    Success,
    /// Processor already sent its terminal line
    StatusSent,
    /// Processor already sent an error line
    StatusSentError,
}

/// One parsed CAPI line: a name followed by ordered name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Case-insensitive parameter lookup; first match wins.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// `get` plus a case-insensitive comparison with `expected`.
    pub fn is(&self, name: &str, expected: &str) -> bool {
        self.get(name)
            .is_some_and(|v| v.eq_ignore_ascii_case(expected))
    }

    /// Value as an integer the way the harness sends them (`"1"`, `"0"`, ...).
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Value interpreted as a boolean toggle (`1`, `true`, `enable`, `on`).
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "enable" | "enabled" | "on" | "yes"
            )
        })
    }

    /// The parameters re-joined as `name,value,...`, used for log notes.
    pub fn to_param_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.params {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(k);
            out.push(',');
            out.push_str(v);
        }
        out
    }
}
