use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::host::{Host, shell_quote};

#[derive(Debug, Error)]
pub enum WfdError {
    #[error("no Wi-Fi Display extension loaded")]
    Unavailable,
    #[error("extension failed: {0}")]
    Failed(String),
    #[error("extension reported error: {0}")]
    Reported(String),
}

/// Where the display session should be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTarget<'a> {
    /// RTSP towards a known peer address and control port.
    Peer { ip: &'a str, port: u16 },
    /// Peer found through mDNS on the infrastructure network.
    Mdns,
}

/// Vendor hooks that drive the actual display session (RTSP, UIBC, ...).
pub trait WfdExtension: Send + Sync {
    fn available(&self) -> bool;

    /// Forward a CAPI command (`name,value,...` parameter string) to the
    /// extension function of the same name; returns its response text.
    fn call(&self, func: &str, params: &str) -> Result<String, WfdError>;

    /// Start a session; returns the session id, or `None` if the extension
    /// could not establish one.
    fn start_session(&self, target: SessionTarget<'_>, role: i32) -> Result<Option<u32>, WfdError>;

    /// Start a session after joining a peer's group.
    fn connect_go_start(&self, ip: &str, port: u16, role: i32) -> Result<Option<u32>, WfdError>;
}

/// No extension configured.
#[derive(Debug, Default)]
pub struct NoWfd;

impl WfdExtension for NoWfd {
    fn available(&self) -> bool {
        false
    }

    fn call(&self, _func: &str, _params: &str) -> Result<String, WfdError> {
        Err(WfdError::Unavailable)
    }

    fn start_session(&self, _t: SessionTarget<'_>, _role: i32) -> Result<Option<u32>, WfdError> {
        Err(WfdError::Unavailable)
    }

    fn connect_go_start(&self, _ip: &str, _port: u16, _role: i32) -> Result<Option<u32>, WfdError> {
        Err(WfdError::Unavailable)
    }
}

/// Extension implemented by an external helper program (`-x`), invoked as
/// `<helper> <function> <args...>`. The helper prints its response on stdout;
/// a first line starting with `error` reports a failure.
pub struct HelperWfd {
    program: String,
    host: Arc<dyn Host>,
}

impl HelperWfd {
    pub fn new(program: impl Into<String>, host: Arc<dyn Host>) -> Self {
        Self {
            program: program.into(),
            host,
        }
    }

    fn invoke(&self, func: &str, args: &[&str]) -> Result<String, WfdError> {
        let mut cmd = format!("{} {}", self.program, func);
        for a in args {
            cmd.push(' ');
            cmd.push_str(&shell_quote(a));
        }
        debug!("wfd helper: {}", cmd);
        let out = self
            .host
            .output(&cmd)
            .map_err(|e| WfdError::Failed(e.to_string()))?;
        let out = out.trim_end();
        if out.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("error")) {
            info!("wfd helper {} failed: {}", func, out);
            return Err(WfdError::Reported(out.to_string()));
        }
        Ok(out.to_string())
    }

    fn session_id(out: &str) -> Option<u32> {
        out.lines().next()?.trim().parse::<i64>().ok().and_then(|v| u32::try_from(v).ok())
    }
}

impl WfdExtension for HelperWfd {
    fn available(&self) -> bool {
        true
    }

    fn call(&self, func: &str, params: &str) -> Result<String, WfdError> {
        self.invoke(func, &[params])
    }

    fn start_session(&self, target: SessionTarget<'_>, role: i32) -> Result<Option<u32>, WfdError> {
        let role = role.to_string();
        let out = match target {
            SessionTarget::Peer { ip, port } => {
                let port = port.to_string();
                self.invoke("start_wfd_connection", &[ip, &port, &role])?
            }
            SessionTarget::Mdns => self.invoke("start_wfd_connection", &["mdns", "-100", &role])?,
        };
        Ok(Self::session_id(&out))
    }

    fn connect_go_start(&self, ip: &str, port: u16, role: i32) -> Result<Option<u32>, WfdError> {
        let out = self.invoke(
            "connect_go_start_wfd",
            &[ip, &port.to_string(), &role.to_string()],
        )?;
        Ok(Self::session_id(&out))
    }
}
