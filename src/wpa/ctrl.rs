use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{CtrlError, CtrlIface, EventMonitor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_MAX: usize = 4096;

static CLIENT_COUNTER: AtomicU32 = AtomicU32::new(0);

/// One client socket connected to a supplicant control socket.
pub struct WpaCtrl {
    sock: UnixDatagram,
    local: PathBuf,
}

impl WpaCtrl {
    pub fn open(path: &Path) -> Result<Self, CtrlError> {
        let n = CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let local = std::env::temp_dir().join(format!("sigma_dut-ctrl-{}-{}", std::process::id(), n));
        let _ = std::fs::remove_file(&local);
        let open_err = |source| CtrlError::Open {
            path: path.display().to_string(),
            source,
        };
        let sock = UnixDatagram::bind(&local).map_err(open_err)?;
        let ctrl = Self { sock, local };
        ctrl.sock.connect(path).map_err(open_err)?;
        Ok(ctrl)
    }

    /// Send a command and wait for its reply, skipping unsolicited `<N>` events.
    pub fn request(&self, cmd: &str) -> Result<String, CtrlError> {
        self.sock.send(cmd.as_bytes())?;
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.recv(left)? {
                Some(msg) if msg.starts_with('<') => {
                    trace!("skipping unsolicited '{}'", msg.trim_end());
                }
                Some(msg) => return Ok(msg),
                None => return Err(CtrlError::Timeout(cmd.to_string())),
            }
        }
    }

    pub fn attach(&self) -> Result<(), CtrlError> {
        match self.request("ATTACH")?.as_str() {
            "OK\n" | "OK" => Ok(()),
            _ => Err(CtrlError::Attach),
        }
    }

    pub fn recv(&self, timeout: Duration) -> Result<Option<String>, CtrlError> {
        if timeout.is_zero() {
            return Ok(None);
        }
        self.sock.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; REPLY_MAX];
        match self.sock.recv(&mut buf) {
            Ok(n) => Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned())),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WpaCtrl {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

/// Control sockets living in one directory, one per interface.
#[derive(Debug, Clone)]
pub struct SocketCtrl {
    dir: String,
}

impl SocketCtrl {
    /// `dir` is used as a plain prefix, so it normally ends with `/`.
    pub fn new(dir: impl Into<String>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, ifname: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.dir, ifname))
    }
}

impl CtrlIface for SocketCtrl {
    fn request(&self, ifname: &str, cmd: &str) -> Result<String, CtrlError> {
        let ctrl = WpaCtrl::open(&self.path(ifname))?;
        ctrl.request(cmd)
    }

    fn monitor(&self, ifname: &str) -> Result<Box<dyn EventMonitor>, CtrlError> {
        let ctrl = WpaCtrl::open(&self.path(ifname))?;
        ctrl.attach()?;
        debug!("attached monitor to {}", ifname);
        Ok(Box::new(SocketMonitor { ctrl }))
    }
}

struct SocketMonitor {
    ctrl: WpaCtrl,
}

impl EventMonitor for SocketMonitor {
    fn recv(&mut self, timeout: Duration) -> Result<Option<String>, CtrlError> {
        self.ctrl.recv(timeout)
    }
}

impl Drop for SocketMonitor {
    fn drop(&mut self) {
        let _ = self.ctrl.request("DETACH");
    }
}
