use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub mod ctrl;
pub mod events;

#[derive(Debug, Error)]
pub enum CtrlError {
    #[error("cannot open control socket {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("control socket i/o: {0}")]
    Io(#[from] io::Error),
    #[error("timeout waiting for reply to {0}")]
    Timeout(String),
    #[error("command failed: {0}")]
    Failed(String),
    #[error("ATTACH rejected")]
    Attach,
    #[error("monitor closed")]
    Closed,
    #[error("unexpected reply to {cmd}: {reply}")]
    BadReply { cmd: String, reply: String },
}

/// Request/response access to the per-interface control sockets.
pub trait CtrlIface: Send + Sync {
    /// Send `cmd` to `ifname` and return the raw reply text.
    fn request(&self, ifname: &str, cmd: &str) -> Result<String, CtrlError>;
    /// Open an attached socket that receives unsolicited events.
    fn monitor(&self, ifname: &str) -> Result<Box<dyn EventMonitor>, CtrlError>;
}

/// An attached control socket.
pub trait EventMonitor: Send {
    /// Next event line, `None` when `timeout` elapsed without one.
    fn recv(&mut self, timeout: Duration) -> Result<Option<String>, CtrlError>;
}

/// Helpers shared by every command handler.
pub trait CtrlExt: CtrlIface {
    /// Like `request`, but a `FAIL` reply is an error.
    fn command(&self, ifname: &str, cmd: &str) -> Result<(), CtrlError> {
        debug!("wpa_command(ifname='{}', cmd='{}')", ifname, cmd);
        let reply = self.request(ifname, cmd)?;
        if reply.starts_with("FAIL") {
            info!("wpa_command: '{}' failed (FAIL received)", cmd);
            return Err(CtrlError::Failed(cmd.to_string()));
        }
        Ok(())
    }

    /// `request` with the reply trimmed, `FAIL` treated as an error.
    fn query(&self, ifname: &str, cmd: &str) -> Result<String, CtrlError> {
        debug!("wpa_command(ifname='{}', cmd='{}')", ifname, cmd);
        let reply = self.request(ifname, cmd)?;
        if reply.starts_with("FAIL") {
            return Err(CtrlError::Failed(cmd.to_string()));
        }
        Ok(reply.trim_end().to_string())
    }

    /// One `field=value` entry of `STATUS`.
    fn status_field(&self, ifname: &str, field: &str) -> Result<Option<String>, CtrlError> {
        let reply = self.request(ifname, "STATUS")?;
        Ok(field_value(&reply, field).map(str::to_string))
    }

    fn add_network(&self, ifname: &str) -> Result<u32, CtrlError> {
        let reply = self.query(ifname, "ADD_NETWORK")?;
        match reply.trim().parse() {
            Ok(id) => Ok(id),
            Err(_) => Err(CtrlError::BadReply {
                cmd: "ADD_NETWORK".into(),
                reply,
            }),
        }
    }

    fn set_network(&self, ifname: &str, id: u32, field: &str, value: &str) -> Result<(), CtrlError> {
        self.command(ifname, &format!("SET_NETWORK {} {} {}", id, field, value))
    }

    fn set_network_quoted(
        &self,
        ifname: &str,
        id: u32,
        field: &str,
        value: &str,
    ) -> Result<(), CtrlError> {
        self.command(ifname, &format!("SET_NETWORK {} {} \"{}\"", id, field, value))
    }

    /// Drop every configured network. Individual failures are ignored.
    fn remove_networks(&self, ifname: &str) {
        let Ok(list) = self.request(ifname, "LIST_NETWORKS") else {
            return;
        };
        for id in list_networks(&list).into_iter().map(|n| n.id) {
            let _ = self.command(ifname, &format!("REMOVE_NETWORK {}", id));
        }
    }

    /// One `field=value` entry of `SIGNAL_POLL`.
    fn signal_poll(&self, ifname: &str, field: &str) -> Result<Option<String>, CtrlError> {
        let reply = self.request(ifname, "SIGNAL_POLL")?;
        Ok(field_value(&reply, field).map(str::to_string))
    }
}

impl<T: CtrlIface + ?Sized> CtrlExt for T {}

/// Find `field=` at the start of a line.
pub fn field_value<'a>(text: &'a str, field: &str) -> Option<&'a str> {
    text.lines().find_map(|l| {
        l.strip_prefix(field)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// One row of `LIST_NETWORKS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub id: u32,
    pub ssid: String,
    pub bssid: String,
    pub flags: String,
}

/// Parse the tab separated `LIST_NETWORKS` table, skipping the header.
pub fn list_networks(text: &str) -> Vec<NetworkEntry> {
    text.lines()
        .skip(1)
        .filter_map(|l| {
            let mut cols = l.split('\t');
            let id = cols.next()?.trim().parse().ok()?;
            Some(NetworkEntry {
                id,
                ssid: cols.next().unwrap_or_default().to_string(),
                bssid: cols.next().unwrap_or_default().to_string(),
                flags: cols.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}
