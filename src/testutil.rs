//! In-memory stand-ins for the supplicant and the host, used by unit tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::host::Host;
use crate::wpa::{CtrlError, CtrlIface, EventMonitor};

#[derive(Default)]
struct CtrlState {
    sent: Vec<String>,
    sticky: HashMap<String, String>,
    once: HashMap<String, VecDeque<String>>,
    events: HashMap<String, Arc<Mutex<VecDeque<String>>>>,
    down: HashSet<String>,
}

/// Scripted supplicant. Replies are looked up as `"<ifname>: <cmd>"` first,
/// then `"<cmd>"`; one-shot replies win over sticky ones. Anything unscripted
/// answers `OK`.
#[derive(Clone, Default)]
pub struct FakeCtrl {
    state: Arc<Mutex<CtrlState>>,
}

impl FakeCtrl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, key: &str, text: &str) {
        let mut s = self.state.lock().unwrap();
        s.sticky.insert(key.to_string(), text.to_string());
    }

    pub fn reply_once(&self, key: &str, text: &str) {
        let mut s = self.state.lock().unwrap();
        s.once
            .entry(key.to_string())
            .or_default()
            .push_back(text.to_string());
    }

    /// Queue an unsolicited event for monitors on `ifname`.
    pub fn event(&self, ifname: &str, line: &str) {
        let q = self.queue(ifname);
        q.lock().unwrap().push_back(line.to_string());
    }

    /// Make every request to `ifname` fail to connect.
    pub fn down(&self, ifname: &str) {
        self.state.lock().unwrap().down.insert(ifname.to_string());
    }

    /// Every request so far as `"<ifname>: <cmd>"`.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_cmds(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| s.split_once(": ").map(|(_, c)| c.to_string()))
            .collect()
    }

    pub fn was_sent(&self, cmd: &str) -> bool {
        self.sent_cmds().iter().any(|c| c == cmd)
    }

    fn queue(&self, ifname: &str) -> Arc<Mutex<VecDeque<String>>> {
        let mut s = self.state.lock().unwrap();
        s.events.entry(ifname.to_string()).or_default().clone()
    }
}

impl CtrlIface for FakeCtrl {
    fn request(&self, ifname: &str, cmd: &str) -> Result<String, CtrlError> {
        let mut s = self.state.lock().unwrap();
        if s.down.contains(ifname) {
            return Err(CtrlError::Open {
                path: ifname.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        s.sent.push(format!("{}: {}", ifname, cmd));
        let scoped = format!("{}: {}", ifname, cmd);
        for key in [scoped.as_str(), cmd] {
            if let Some(q) = s.once.get_mut(key)
                && let Some(r) = q.pop_front()
            {
                return Ok(r);
            }
        }
        for key in [scoped.as_str(), cmd] {
            if let Some(r) = s.sticky.get(key) {
                return Ok(r.clone());
            }
        }
        Ok(match cmd {
            "PING" => "PONG\n".into(),
            "STATUS" => "wpa_state=DISCONNECTED\n".into(),
            "ADD_NETWORK" => "0\n".into(),
            "LIST_NETWORKS" => "network id / ssid / bssid / flags\n".into(),
            _ => "OK\n".into(),
        })
    }

    fn monitor(&self, ifname: &str) -> Result<Box<dyn EventMonitor>, CtrlError> {
        if self.state.lock().unwrap().down.contains(ifname) {
            return Err(CtrlError::Attach);
        }
        Ok(Box::new(FakeMonitor {
            queue: self.queue(ifname),
            idle: false,
        }))
    }
}

/// Replays queued events; an empty queue reports the monitor as closed
/// unless built with `idle()`.
pub struct FakeMonitor {
    queue: Arc<Mutex<VecDeque<String>>>,
    idle: bool,
}

impl FakeMonitor {
    pub fn new(events: &[&str]) -> Self {
        Self {
            queue: Arc::new(Mutex::new(events.iter().map(|e| e.to_string()).collect())),
            idle: false,
        }
    }

    pub fn idle() -> Self {
        Self {
            queue: Arc::default(),
            idle: true,
        }
    }
}

impl EventMonitor for FakeMonitor {
    fn recv(&mut self, timeout: Duration) -> Result<Option<String>, CtrlError> {
        if let Some(ev) = self.queue.lock().unwrap().pop_front() {
            return Ok(Some(ev));
        }
        if self.idle {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        Err(CtrlError::Closed)
    }
}

#[derive(Default)]
struct HostState {
    ran: Vec<String>,
    exit_codes: Vec<(String, i32)>,
    outputs: Vec<(String, String)>,
    ifaces: HashSet<String>,
    files: HashMap<String, String>,
}

/// Records shell commands; exit codes and outputs are matched by command prefix.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_code(&self, prefix: &str, code: i32) {
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .push((prefix.to_string(), code));
    }

    pub fn output_for(&self, prefix: &str, out: &str) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .push((prefix.to_string(), out.to_string()));
    }

    pub fn add_iface(&self, ifname: &str) {
        self.state.lock().unwrap().ifaces.insert(ifname.to_string());
    }

    pub fn add_file(&self, path: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn ran(&self) -> Vec<String> {
        self.state.lock().unwrap().ran.clone()
    }

    pub fn ran_prefix(&self, prefix: &str) -> bool {
        self.ran().iter().any(|c| c.starts_with(prefix))
    }
}

impl Host for FakeHost {
    fn run(&self, cmd: &str) -> io::Result<i32> {
        let mut s = self.state.lock().unwrap();
        s.ran.push(cmd.to_string());
        Ok(s
            .exit_codes
            .iter()
            .rev()
            .find(|(p, _)| cmd.starts_with(p.as_str()))
            .map(|(_, c)| *c)
            .unwrap_or(0))
    }

    fn output(&self, cmd: &str) -> io::Result<String> {
        let mut s = self.state.lock().unwrap();
        s.ran.push(cmd.to_string());
        Ok(s
            .outputs
            .iter()
            .rev()
            .find(|(p, _)| cmd.starts_with(p.as_str()))
            .map(|(_, o)| o.clone())
            .unwrap_or_default())
    }

    fn iface_exists(&self, ifname: &str) -> bool {
        self.state.lock().unwrap().ifaces.contains(ifname)
    }

    fn file_exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    fn read_file(&self, path: &str) -> io::Result<String> {
        self.file(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write_file(&self, path: &str, contents: &str) -> io::Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn sleep(&self, _d: Duration) {}
}
