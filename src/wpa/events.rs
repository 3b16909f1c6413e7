use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use super::{CtrlError, EventMonitor};

/// Default bound for every event wait.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(120);
/// Granularity at which the cancel flag is checked.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Unsolicited supplicant events the handlers wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpaEvent {
    GroupStarted,
    GroupRemoved,
    GoNegFailure,
    GoNegRequest,
    GroupFormationFailure,
    InvitationResult,
    Connected,
    Disconnected,
    ScanResults,
    ApStaConnected,
}

impl WpaEvent {
    pub fn prefix(self) -> &'static str {
        match self {
            WpaEvent::GroupStarted => "P2P-GROUP-STARTED",
            WpaEvent::GroupRemoved => "P2P-GROUP-REMOVED",
            WpaEvent::GoNegFailure => "P2P-GO-NEG-FAILURE",
            WpaEvent::GoNegRequest => "P2P-GO-NEG-REQUEST",
            WpaEvent::GroupFormationFailure => "P2P-GROUP-FORMATION-FAILURE",
            WpaEvent::InvitationResult => "P2P-INVITATION-RESULT",
            WpaEvent::Connected => "CTRL-EVENT-CONNECTED",
            WpaEvent::Disconnected => "CTRL-EVENT-DISCONNECTED",
            WpaEvent::ScanResults => "CTRL-EVENT-SCAN-RESULTS",
            WpaEvent::ApStaConnected => "AP-STA-CONNECTED",
        }
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout waiting for events")]
    Timeout,
    #[error("wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Ctrl(#[from] CtrlError),
}

/// Event text after the `<N>` priority marker; `None` when there is no marker.
pub fn event_body(msg: &str) -> Option<&str> {
    msg.split_once('>').map(|(_, body)| body.trim_end_matches(['\r', '\n']))
}

/// Which of `wanted` the message is, if any.
pub fn classify(msg: &str, wanted: &[WpaEvent]) -> Option<WpaEvent> {
    let body = event_body(msg)?;
    wanted.iter().copied().find(|e| body.starts_with(e.prefix()))
}

/// Block until one of `wanted` arrives, `timeout` passes or `cancel` is raised.
/// Returns the matched event and its body without the priority marker.
pub fn wait_for(
    mon: &mut dyn EventMonitor,
    wanted: &[WpaEvent],
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<(WpaEvent, String), WaitError> {
    for e in wanted {
        debug!("Waiting for wpa_cli event: {}", e.prefix());
    }
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(WaitError::Cancelled);
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            info!("Timeout on waiting for events");
            return Err(WaitError::Timeout);
        }
        let Some(msg) = mon.recv(left.min(POLL_SLICE))? else {
            continue;
        };
        if let Some(ev) = classify(&msg, wanted)
            && let Some(body) = event_body(&msg)
        {
            return Ok((ev, body.to_string()));
        }
    }
}

/// Role of this device in a P2P group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Go,
    Client,
}

impl GroupRole {
    pub fn as_wfa(self) -> &'static str {
        match self {
            GroupRole::Go => "GO",
            GroupRole::Client => "CLIENT",
        }
    }
}

/// Fields of `P2P-GROUP-STARTED <ifname> <GO|client> ssid="..." freq=.. ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStarted {
    pub ifname: String,
    pub role: GroupRole,
    pub ssid: String,
    pub freq: Option<u32>,
    pub passphrase: Option<String>,
    pub go_dev_addr: Option<String>,
    pub persistent: bool,
}

impl GroupStarted {
    pub fn parse(body: &str) -> Option<Self> {
        let rest = body.strip_prefix(WpaEvent::GroupStarted.prefix())?.trim_start();
        let mut it = rest.splitn(3, ' ');
        let ifname = it.next().filter(|s| !s.is_empty())?.to_string();
        let role = match it.next()? {
            "GO" => GroupRole::Go,
            "client" => GroupRole::Client,
            _ => return None,
        };
        let tail = it.next().unwrap_or_default();
        let ssid = quoted_value(tail, "ssid").unwrap_or_default();
        let freq = token_value(tail, "freq").and_then(|v| v.parse().ok());
        Some(Self {
            ifname,
            role,
            ssid,
            freq,
            passphrase: quoted_value(tail, "passphrase"),
            go_dev_addr: token_value(tail, "go_dev_addr").map(str::to_string),
            persistent: tail.split_whitespace().any(|t| t == "[PERSISTENT]"),
        })
    }

    /// WFA group identifier: `<go_dev_addr> <ssid>`.
    pub fn group_id(&self, own_addr: &str) -> String {
        let go = self.go_dev_addr.as_deref().unwrap_or(own_addr);
        format!("{} {}", go, self.ssid)
    }
}

/// `name="value"` where the value may contain spaces; ends at `" ` or the last quote.
fn quoted_value(text: &str, name: &str) -> Option<String> {
    let key = format!("{}=\"", name);
    let start = text.find(&key)? + key.len();
    let rest = &text[start..];
    let end = rest.find("\" ").or_else(|| rest.rfind('"'))?;
    Some(rest[..end].to_string())
}

fn token_value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.split_whitespace().find_map(|t| {
        t.strip_prefix(name).and_then(|r| r.strip_prefix('='))
    })
}

/// Peer MAC in `AP-STA-CONNECTED <mac> [p2p_dev_addr=<addr>]`.
pub fn sta_connected_addr(body: &str) -> Option<&str> {
    body.strip_prefix(WpaEvent::ApStaConnected.prefix())?
        .split_whitespace()
        .next()
}

/// Status code of `P2P-INVITATION-RESULT status=<n>`.
pub fn invitation_status(body: &str) -> Option<i32> {
    token_value(body, "status").and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMonitor;

    #[test]
    fn classify_requires_marker() {
        let wanted = [WpaEvent::GroupStarted, WpaEvent::GoNegFailure];
        assert_eq!(
            classify("<3>P2P-GO-NEG-FAILURE status=1", &wanted),
            Some(WpaEvent::GoNegFailure)
        );
        assert_eq!(classify("P2P-GO-NEG-FAILURE status=1", &wanted), None);
        assert_eq!(classify("<3>P2P-DEVICE-FOUND 02:00", &wanted), None);
    }

    #[test]
    fn wait_skips_unrelated_events() {
        let mut mon = FakeMonitor::new(&[
            "<3>CTRL-EVENT-SCAN-STARTED ",
            "<3>P2P-DEVICE-FOUND 02:00:00:00:00:02",
            "<3>P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-ab\" freq=2437 passphrase=\"secret12\" go_dev_addr=02:00:00:00:00:01",
        ]);
        let cancel = AtomicBool::new(false);
        let (ev, body) = wait_for(
            &mut mon,
            &[WpaEvent::GroupStarted, WpaEvent::GroupFormationFailure],
            Duration::from_secs(5),
            &cancel,
        )
        .unwrap();
        assert_eq!(ev, WpaEvent::GroupStarted);
        assert!(body.starts_with("P2P-GROUP-STARTED p2p-wlan0-0"));
    }

    #[test]
    fn wait_is_cancellable() {
        let mut mon = FakeMonitor::new(&[]);
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            wait_for(&mut mon, &[WpaEvent::GroupStarted], Duration::from_secs(5), &cancel),
            Err(WaitError::Cancelled)
        ));
    }

    #[test]
    fn wait_times_out() {
        let mut mon = FakeMonitor::idle();
        let cancel = AtomicBool::new(false);
        let t0 = Instant::now();
        assert!(matches!(
            wait_for(&mut mon, &[WpaEvent::GroupStarted], Duration::from_millis(50), &cancel),
            Err(WaitError::Timeout)
        ));
        assert!(t0.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn parse_group_started_go() {
        let g = GroupStarted::parse(
            "P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-ab test\" freq=2437 passphrase=\"secret12\" go_dev_addr=02:00:00:00:00:01 [PERSISTENT]",
        )
        .unwrap();
        assert_eq!(g.ifname, "p2p-wlan0-0");
        assert_eq!(g.role, GroupRole::Go);
        assert_eq!(g.ssid, "DIRECT-ab test");
        assert_eq!(g.freq, Some(2437));
        assert_eq!(g.passphrase.as_deref(), Some("secret12"));
        assert!(g.persistent);
        assert_eq!(g.group_id("ff"), "02:00:00:00:00:01 DIRECT-ab test");
    }

    #[test]
    fn parse_group_started_client() {
        let g = GroupStarted::parse(
            "P2P-GROUP-STARTED wlan0 client ssid=\"DIRECT-cd\" freq=5180 psk=0011 go_dev_addr=02:00:00:00:00:09",
        )
        .unwrap();
        assert_eq!(g.role, GroupRole::Client);
        assert_eq!(g.ssid, "DIRECT-cd");
        assert_eq!(g.passphrase, None);
        assert!(!g.persistent);
        assert!(GroupStarted::parse("P2P-GROUP-STARTED wlan0 observer").is_none());
    }

    #[test]
    fn misc_event_fields() {
        assert_eq!(
            sta_connected_addr("AP-STA-CONNECTED 02:00:00:00:00:07 p2p_dev_addr=02:00:00:00:00:08"),
            Some("02:00:00:00:00:07")
        );
        assert_eq!(invitation_status("P2P-INVITATION-RESULT status=0"), Some(0));
    }
}
