//! Wi-Fi Display (Miracast) commands. Session handling itself is delegated
//! to the `WfdExtension`; this module drives P2P, DHCP and peer discovery.
use anyhow::{Context, Result, bail};
use std::thread;
use tracing::{debug, error, info};

use crate::cmds::p2p::{connect_method, discover_peer};
use crate::dhcp::{client_peer_ip, go_peer_ip, start_dhcp, stop_dhcp};
use crate::dispatch::{CommandTable, Reply};
use crate::dut::{
    Dut, DutEnv, WFD_DEFAULT_SESSION_PORT, WfdDeviceType, WpsMethod, channel_to_freq,
};
use crate::netcfg::kill_dhcp_client;
use crate::proto::command::{CmdResult, Command, Status};
use crate::wfd::{SessionTarget, WfdError};
use crate::wpa::events::{GroupRole, GroupStarted, WpaEvent, sta_connected_addr, wait_for};
use crate::wpa::{CtrlExt, EventMonitor, list_networks};

const NO_SESSION: &str = "result,NULL,GroupID,NULL,WFDSessionID,NULL";
/// Peer address wait limits, seconds.
const SINK_IP_WAIT: u32 = 100;
const SOURCE_IP_WAIT: u32 = 500;

pub fn register(t: &mut CommandTable) {
    t.register(
        "start_wfd_connection",
        Some(|c| c.has("interface") && c.has("PeerAddress")),
        start_wfd_connection,
    );
    t.register(
        "connect_go_start_wfd",
        Some(|c| c.has("interface") && c.has("P2pdevID") && c.has("GroupID")),
        connect_go_start_wfd,
    );
    t.register(
        "sta_generate_event",
        Some(|c| c.has("interface") && c.has("Type") && c.get("Program") == Some("WFD")),
        sta_generate_event,
    );
    t.register(
        "reinvoke_wfd_session",
        Some(|c| c.has("interface") && c.has("peerAddress") && c.has("InvitationAction")),
        reinvoke_wfd_session,
    );
}

fn session_field(id: Option<u32>) -> String {
    match id {
        Some(id) => format!("{:08}", id),
        None => "NULL".to_string(),
    }
}

/// `wfd_subelems=...` part of a `P2P_PEER` reply.
fn wfd_subelems(peer_info: &str) -> Option<&str> {
    peer_info.find("wfd_subelems=").map(|pos| &peer_info[pos..])
}

/// Session availability bits of the peer's device information.
fn session_available(subelems: &str) -> bool {
    subelems
        .as_bytes()
        .get(21)
        .and_then(|b| (*b as char).to_digit(16))
        .is_some_and(|bits| bits & 0x3 != 0)
}

/// RTSP control port advertised in the peer's device information.
fn rtsp_port(subelems: &str) -> Option<u16> {
    let hex = subelems.get(23..)?;
    let hex = hex.get(..4).unwrap_or(hex);
    u16::from_str_radix(hex, 16).ok()
}

pub fn set_wfd_ie(dut: &Dut) {
    let intf = dut.env.main_ifname();
    debug!("set_wfd_ie: intf = {}", intf);
    let ctrl = dut.ctrl();
    let _ = ctrl.command(&intf, "SET wifi_display 1");
    let (info, ext) = match dut.wfd_device_type {
        WfdDeviceType::Source => ("000601101c440036", "00020000"),
        _ => ("000601511c440036", "00020001"),
    };
    let _ = ctrl.command(&intf, &format!("WFD_SUBELEM_SET 0 {}", info));
    let _ = ctrl.command(&intf, &format!("WFD_SUBELEM_SET 11 {}", ext));
}

pub fn reset_default(dut: &mut Dut, c: &Command) {
    let intf = dut.env.main_ifname();
    debug!("miracast reset_default: intf = {}", intf);
    stop_dhcp(&dut.env, &intf, GroupRole::Go);
    kill_dhcp_client(&dut.env, &intf);
    if !dut.env.wfd.available() {
        info!("Wi-Fi Display extension is absent");
        return;
    }
    if let Err(e) = dut.env.wfd.call("sta_reset_default", &c.to_param_string()) {
        info!("sta_reset_default: {}", e);
    }
}

pub fn dev_send_frame(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if !dut.env.wfd.available() {
        return Ok(CmdResult::Invalid);
    }
    let params = c.to_param_string();
    let frame = c.get("FrameName").unwrap_or_default();

    if frame.eq_ignore_ascii_case("RTSP") {
        let Some(msg) = c.get("RtspMsgType") else {
            return Ok(r.error("errorCode,Unsupported dev_send_frame"));
        };
        let msg = msg.to_ascii_uppercase();
        match msg.as_str() {
            "PAUSE" | "TRIGGER-PAUSE" | "PLAY" | "TRIGGER-PLAY" | "TEARDOWN"
            | "TRIGGER-TEARDOWN" | "SETUP" => {}
            "SET_PARAMETER" => {
                if !c.has("SetParameter") && !c.has("TransportType") {
                    return Ok(r.error("errorCode,Invalid Set Parameter value"));
                }
            }
            _ => return Ok(r.error("errorCode,Unsupported dev_send_frame")),
        }
        if let Err(e) = dut.env.wfd.call("dev_send_frame", &params) {
            info!("dev_send_frame: {}", e);
        }
        return Ok(CmdResult::Success);
    }

    if frame.eq_ignore_ascii_case("WFD_ProbeReq") {
        return Ok(r.error("errorCode,Unsupported WFD Probe Request"));
    }
    if frame.eq_ignore_ascii_case("WFD_ServiceDiscReq") {
        return Ok(r.error("errorCode,Unsupported WFD Service Discovery"));
    }
    Ok(r.error("errorCode,Unsupported dev_send_frame"))
}

pub fn dev_exec_action(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if c.has("ServiceType") {
        debug!("mDNS instance name = {}", dut.mdns_instance_name);
        let resp = format!("InstanceName,{}", dut.mdns_instance_name);
        return Ok(r.complete(&resp));
    }
    match dut.env.wfd.call("dev_exec_action", &c.to_param_string()) {
        Ok(_) => Ok(CmdResult::Success),
        Err(e) => {
            info!("dev_exec_action: {}", e);
            Ok(CmdResult::Error)
        }
    }
}

pub fn preset_testparameters(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if let Some(t) = c.get("WFDDevType").and_then(WfdDeviceType::from_name) {
        dut.wfd_device_type = t;
    }
    let resp = match dut.env.wfd.call("sta_preset_testparameters", &c.to_param_string()) {
        Ok(resp) => resp,
        Err(WfdError::Unavailable) => return Ok(CmdResult::Invalid),
        Err(e) => {
            info!("sta_preset_testparameters: {}", e);
            return Ok(r.error(
                "Miracast extension reported error in the command sta_preset_testparameters",
            ));
        }
    };
    if c.has("mdns_disc") && c.has("mdns_role") {
        dut.mdns_instance_name = resp;
    }
    Ok(CmdResult::Success)
}

pub fn sta_get_parameter(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Some(param) = c.get("Parameter") else {
        return Ok(r.complete("NULL"));
    };
    if !param.eq_ignore_ascii_case("DiscoveredDevList") {
        return Ok(r.error("Invalid Parameter"));
    }

    let intf = dut.env.main_ifname();
    let mut peers: Vec<String> = Vec::new();
    let mut req = "P2P_PEER FIRST".to_string();
    while let Ok(reply) = dut.ctrl().request(&intf, &req) {
        if reply.starts_with("FAIL") || reply.is_empty() {
            break;
        }
        let addr: String = reply.chars().take(17).collect();
        req = format!("P2P_PEER NEXT-{}", addr);
        peers.push(addr);
    }
    Ok(r.complete(&format!("DeviceList,{}", peers.join(" "))))
}

/// What a background session worker needs from the DUT state.
#[derive(Clone)]
struct SessionPlan {
    env: DutEnv,
    device_type: WfdDeviceType,
    port: u16,
    peer_mac: String,
}

impl SessionPlan {
    fn new(dut: &Dut) -> Self {
        Self {
            env: dut.env.clone(),
            device_type: dut.wfd_device_type,
            port: dut.wfd_session_port,
            peer_mac: dut.peer_mac_address.clone(),
        }
    }

    fn ip_wait(&self) -> u32 {
        if self.device_type.is_sink() {
            SINK_IP_WAIT
        } else {
            SOURCE_IP_WAIT
        }
    }

    fn start(&self, ip: &str) -> Option<u32> {
        let target = SessionTarget::Peer { ip, port: self.port };
        match self.env.wfd.start_session(target, self.device_type.session_role()) {
            Ok(id) => id,
            Err(e) => {
                info!("start_wfd_connection: {}", e);
                None
            }
        }
    }

    /// GO side: serve DHCP, then find the peer in the leases.
    fn go_peer(&self, ifname: &str, sta_mac: Option<&str>, wait: u32) -> Option<String> {
        stop_dhcp(&self.env, ifname, GroupRole::Go);
        start_dhcp(&self.env, ifname, GroupRole::Go);
        self.env.sleep_secs(5);
        let macs: Vec<&str> = sta_mac.into_iter().chain([self.peer_mac.as_str()]).collect();
        go_peer_ip(&self.env, &macs, wait)
    }
}

/// A formed group as seen from this device.
struct Connection {
    ifname: String,
    role: GroupRole,
    /// Interface address the peer associated with, when we are GO.
    sta_mac: Option<String>,
}

/// Wait for group formation to finish on `mon`. A GO additionally waits for
/// the peer to associate so its interface address is known.
fn connection_event(env: &DutEnv, mon: &mut dyn EventMonitor) -> Option<Connection> {
    let wanted = [
        WpaEvent::GroupStarted,
        WpaEvent::GoNegFailure,
        WpaEvent::GroupFormationFailure,
    ];
    let (ev, body) = match wait_for(mon, &wanted, env.cfg.event_timeout, &env.stop) {
        Ok(r) => r,
        Err(e) => {
            error!("Group formation did not complete: {}", e);
            return None;
        }
    };
    debug!("Received event {}", body);
    if ev != WpaEvent::GroupStarted {
        return None;
    }
    let group = GroupStarted::parse(&body)?;
    info!("P2P connection done on {} as {}", group.ifname, group.role.as_wfa());

    let mut sta_mac = None;
    if group.role == GroupRole::Go {
        match env.ctrl.monitor(&group.ifname) {
            Ok(mut gmon) => {
                match wait_for(
                    gmon.as_mut(),
                    &[WpaEvent::ApStaConnected],
                    env.cfg.event_timeout,
                    &env.stop,
                ) {
                    Ok((_, body)) => sta_mac = sta_connected_addr(&body).map(str::to_string),
                    Err(e) => error!("Could not get AP-STA-CONNECTED: {}", e),
                }
            }
            Err(e) => error!("Failed to open monitor on {}: {}", group.ifname, e),
        }
    }
    Some(Connection {
        ifname: group.ifname,
        role: group.role,
        sta_mac,
    })
}

/// Deferred session setup: wait for the peer to form the group, then start
/// the session once DHCP settled.
fn spawn_rtsp_worker(plan: SessionPlan) {
    thread::spawn(move || {
        let env = &plan.env;
        let intf = env.main_ifname();
        let conn = match env.ctrl.monitor(&intf) {
            Ok(mut mon) => connection_event(env, mon.as_mut()),
            Err(e) => {
                error!("Failed to open monitor on {}: {}", intf, e);
                None
            }
        };
        let Some(conn) = conn else {
            error!("P2P connection failure");
            return;
        };
        let wait = plan.ip_wait();
        let ip = match conn.role {
            GroupRole::Client => {
                env.sleep_secs(5);
                start_dhcp(env, &conn.ifname, GroupRole::Client);
                env.sleep_secs(5);
                client_peer_ip(env, &conn.ifname, wait)
            }
            GroupRole::Go => plan.go_peer(&conn.ifname, conn.sta_mac.as_deref(), wait),
        };
        match ip {
            Some(ip) => {
                plan.start(&ip);
            }
            None => error!("Could not get peer IP"),
        }
        info!("Wi-Fi Display session worker exit");
    });
}

/// Serve an autonomous GO group: DHCP right away, then a session once a
/// peer joins. Only the session wait runs in the background.
pub fn start_autonomous_go(dut: &Dut, ifname: &str) -> Result<()> {
    if !dut.env.wfd.available() {
        bail!("Wi-Fi Display extension is absent");
    }
    let env = &dut.env;
    stop_dhcp(env, ifname, GroupRole::Go);
    if !start_dhcp(env, ifname, GroupRole::Go) {
        bail!("Failed to start DHCP server on {}", ifname);
    }
    let mut mon = env
        .ctrl
        .monitor(ifname)
        .with_context(|| format!("Failed to open monitor on {}", ifname))?;

    let plan = SessionPlan::new(dut);
    thread::spawn(move || {
        let env = &plan.env;
        env.sleep_secs(5);

        info!("Wait for AP-STA-CONNECTED");
        let mac = match wait_for(
            mon.as_mut(),
            &[WpaEvent::ApStaConnected],
            env.cfg.event_timeout,
            &env.stop,
        ) {
            Ok((_, body)) => sta_connected_addr(&body).map(str::to_string),
            Err(e) => {
                error!("Could not get event before timeout: {}", e);
                return;
            }
        };
        let Some(mac) = mac else {
            error!("Could not find STA MAC");
            return;
        };
        match go_peer_ip(env, &[&mac], 30) {
            Some(ip) => {
                plan.start(&ip);
            }
            None => error!("Could not get peer IP"),
        }
        info!("Auto GO worker exit");
    });
    Ok(())
}

fn mdns_start_wfd_connection(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if !dut.env.wfd.available() {
        return Ok(CmdResult::Invalid);
    }
    let init_wfd = c.get_int("init_wfd").unwrap_or(-1);
    let role = dut.wfd_device_type.session_role();
    let id = match dut.env.wfd.start_session(SessionTarget::Mdns, role) {
        Ok(id) => id,
        Err(e) => {
            info!("start_wfd_connection: {}", e);
            None
        }
    };
    if init_wfd == 0 {
        return Ok(r.complete(NO_SESSION));
    }
    let resp = format!("result,NULL,GroupID,NULL,WFDSessionID,{}", session_field(id));
    Ok(r.complete(&resp))
}

fn start_wfd_connection(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default().to_string();
    let peer = c.get("PeerAddress").unwrap_or_default().to_string();

    if c.is("R2ConnectionType", "Infrastructure") {
        return mdns_start_wfd_connection(dut, r, c);
    }
    if c.get_int("coupledSession") == Some(1) {
        return Ok(r.error("errorCode,Coupled Session is unsupported"));
    }
    if c.get_int("TDLS") == Some(1) {
        return Ok(r.error("errorCode,TDLS is unsupported"));
    }
    let go_intent = match c.get_int("intent_val").unwrap_or(0) {
        i if i > 15 => 1,
        i => i,
    };
    let auth = c.get_int("init_wfd") == Some(0);
    let freq = if c.has("oper_chn") {
        let Some(freq) = c
            .get_int("oper_chn")
            .and_then(|ch| u32::try_from(ch).ok())
            .and_then(channel_to_freq)
        else {
            return Ok(r.invalid("errorCode,Unsupported channel"));
        };
        Some(freq)
    } else {
        None
    };

    if !discover_peer(&dut.env, &intf, &peer, true) {
        return Ok(r.error("errorCode,Could not find peer"));
    }

    let (method, _) = connect_method(dut);
    let mut cmd = format!("P2P_CONNECT {}{}", peer, method);
    if dut.persistent {
        cmd.push_str(" persistent");
    }
    cmd.push_str(&format!(" go_intent={}", go_intent));
    if auth {
        cmd.push_str(" auth");
    }
    if let Some(freq) = freq {
        cmd.push_str(&format!(" freq={}", freq));
    }

    // Is the peer available for a session at all?
    dut.peer_mac_address = peer.clone();
    let info = dut
        .ctrl()
        .request(&intf, &format!("P2P_PEER {}", peer))
        .unwrap_or_default();
    let Some(sub) = wfd_subelems(&info).filter(|s| s.len() >= 21) else {
        info!("Did not get WFD SUBELEMS");
        return Ok(r.complete(NO_SESSION));
    };
    if !session_available(sub) {
        return Ok(r.complete(NO_SESSION));
    }
    let mut port = WFD_DEFAULT_SESSION_PORT;
    if dut.wfd_device_type.is_sink() {
        port = rtsp_port(sub).unwrap_or(WFD_DEFAULT_SESSION_PORT);
        info!("SessionManagementControlPort = {}", port);
        dut.wfd_session_port = port;
    }

    let mut mon = if auth {
        None
    } else {
        match dut.ctrl().monitor(&intf) {
            Ok(m) => Some(m),
            Err(e) => {
                error!("Failed to open monitor on {}: {}", intf, e);
                return Ok(CmdResult::Success);
            }
        }
    };
    match dut.ctrl().request(&intf, &cmd) {
        Ok(reply) if !reply.starts_with("FAIL") => {}
        _ => {
            info!("'{}' failed", cmd);
            return Ok(CmdResult::Success);
        }
    }

    let Some(mon) = mon.as_deref_mut() else {
        spawn_rtsp_worker(SessionPlan::new(dut));
        return Ok(r.complete(NO_SESSION));
    };

    let Some(conn) = connection_event(&dut.env, mon) else {
        error!("Group Formation did not complete");
        return Ok(CmdResult::Success);
    };
    let plan = SessionPlan::new(dut);
    match conn.role {
        GroupRole::Go => {
            stop_dhcp(&dut.env, &conn.ifname, GroupRole::Go);
            start_dhcp(&dut.env, &conn.ifname, GroupRole::Go);
        }
        GroupRole::Client => {
            start_dhcp(&dut.env, &conn.ifname, GroupRole::Client);
        }
    }
    dut.env.sleep_secs(5);

    let dev_addr = dut.ctrl().status_field(&conn.ifname, "p2p_device_address")?;
    let ssid = dut.ctrl().status_field(&conn.ifname, "ssid")?;
    let (Some(dev_addr), Some(ssid)) = (dev_addr, ssid) else {
        return Ok(CmdResult::Invalid);
    };

    let ip = match conn.role {
        GroupRole::Client => client_peer_ip(&dut.env, &conn.ifname, 60),
        GroupRole::Go => {
            let macs: Vec<&str> = conn
                .sta_mac
                .as_deref()
                .into_iter()
                .chain([peer.as_str()])
                .collect();
            go_peer_ip(&dut.env, &macs, 30)
        }
    };
    let Some(ip) = ip else {
        return Ok(r.error("Could not get remote IP"));
    };

    if !dut.env.wfd.available() {
        return Ok(CmdResult::Invalid);
    }
    let id = plan.start(&ip);
    let resp = format!(
        "result,{},GroupID,{} {},WFDSessionId,{}",
        conn.role.as_wfa(),
        dev_addr,
        ssid,
        session_field(id)
    );
    Ok(r.complete(&resp))
}

fn connect_go_start_wfd(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default().to_string();
    let dev_id = c.get("P2pdevID").unwrap_or_default().to_string();

    let (suffix, method) = connect_method(dut);
    let cmd = format!("P2P_CONNECT {}{} join", dev_id, suffix);

    if !discover_peer(&dut.env, &intf, &dev_id, false) {
        return Ok(r.error("ErrorCode,Could not discover the requested peer"));
    }
    if dut
        .ctrl()
        .command(&intf, &format!("P2P_PROV_DISC {} {}", dev_id, method))
        .is_err()
    {
        info!("Failed to send provision discovery request");
        return Ok(CmdResult::Error);
    }

    let mut mon = match dut.ctrl().monitor(&intf) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to open monitor on {}: {}", intf, e);
            return Ok(r.error("errorCode,failed P2P connection"));
        }
    };
    match dut.ctrl().request(&intf, &cmd) {
        Ok(reply) if reply.starts_with("FAIL") => {
            return Ok(r.error("errorCode,failed P2P connection"));
        }
        Ok(_) => {}
        Err(e) => {
            error!("'{}': {}", cmd, e);
            return Ok(CmdResult::Success);
        }
    }
    let Some(conn) = connection_event(&dut.env, mon.as_mut()) else {
        return Ok(r.error("errorCode,failed P2P connection"));
    };

    start_dhcp(&dut.env, &conn.ifname, GroupRole::Client);
    let Some(ip) = client_peer_ip(&dut.env, &conn.ifname, 30) else {
        return Ok(r.error("Could not get remote IP"));
    };

    dut.wfd_session_port = WFD_DEFAULT_SESSION_PORT;
    if dut.wfd_device_type.is_sink() {
        let info = dut
            .ctrl()
            .request(&conn.ifname, &format!("P2P_PEER {}", dev_id))
            .unwrap_or_default();
        if let Some(port) = wfd_subelems(&info).and_then(rtsp_port) {
            dut.wfd_session_port = port;
        }
        debug!("SessionManagementControlPort = {}", dut.wfd_session_port);
    }

    let role = dut.wfd_device_type.session_role();
    let id = match dut.env.wfd.connect_go_start(&ip, dut.wfd_session_port, role) {
        Ok(id) => id,
        Err(WfdError::Unavailable) => return Ok(CmdResult::Invalid),
        Err(e) => {
            info!("connect_go_start_wfd: {}", e);
            None
        }
    };
    Ok(r.complete(&format!("WFDSessionId,{}", session_field(id))))
}

fn sta_generate_event(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Some(kind) = c.get("Type") else {
        return Ok(r.invalid("errorCode, Invalid Type for Generate Event"));
    };
    if !dut.env.wfd.available() {
        return Ok(CmdResult::Invalid);
    }
    let params = c.to_param_string();
    let forward = |dut: &Dut| {
        if let Err(e) = dut.env.wfd.call("sta_generate_event", &params) {
            info!("sta_generate_event: {}", e);
        }
    };
    match kind.to_ascii_lowercase().as_str() {
        "uibc_gen" | "uibc_hid" => {
            forward(dut);
            Ok(CmdResult::Success)
        }
        "frameskip" => Ok(CmdResult::Success),
        "inputcontent" => {
            r.send(Status::Complete, None);
            Ok(CmdResult::StatusSent)
        }
        "i2cread" => Ok(r.error("errorCode,Unsupported Type for Generate Event")),
        "i2cwrite" => Ok(r.error("errorCode, Unsupported Type for Generate Event")),
        "idrreq" => {
            if dut.wfd_device_type == WfdDeviceType::Source {
                return Ok(r.error("errorCode, Unsupported Type for Generate Event"));
            }
            r.send(Status::Complete, None);
            forward(dut);
            Ok(CmdResult::StatusSent)
        }
        _ => Ok(CmdResult::Success),
    }
}

fn reinvoke_wfd_session(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let (Some(intf), Some(grp_id), Some(action), Some(peer)) = (
        c.get("interface"),
        c.get("GroupID"),
        c.get("InvitationAction"),
        c.get("peerAddress"),
    ) else {
        return Ok(r.invalid("errorCode,Invalid parameters for Reinvoke WFD Session"));
    };

    if action == "accept" {
        // Joining a running group needs the invitation authorized separately.
        kill_dhcp_client(&dut.env, intf);
        debug!("Trying to discover GO {}", peer);
        if !discover_peer(&dut.env, intf, peer, true) {
            return Ok(r.error("ErrorCode,Could not discover the requested peer"));
        }
        let cred = match dut.wps_method {
            WpsMethod::Pbc => "pbc".to_string(),
            _ => dut.wps_pin.clone(),
        };
        if dut
            .ctrl()
            .command(intf, &format!("P2P_CONNECT {} {} join auth", peer, cred))
            .is_err()
        {
            return Ok(CmdResult::Error);
        }
        spawn_rtsp_worker(SessionPlan::new(dut));
        return Ok(CmdResult::Success);
    }

    let Some((_, ssid)) = grp_id.split_once(' ') else {
        info!("Invalid grpid");
        return Ok(CmdResult::Invalid);
    };
    debug!("Search for persistent group credentials based on SSID: '{}'", ssid);
    let Ok(list) = dut.ctrl().request(intf, "LIST_NETWORKS") else {
        return Ok(CmdResult::Error);
    };
    let Some(net) = list_networks(&list).into_iter().find(|n| n.ssid == ssid) else {
        return Ok(r.error("ErrorCode,Persistent group credentials not found"));
    };

    debug!("Trying to discover peer {} for invitation", peer);
    if !discover_peer(&dut.env, intf, peer, false) {
        return Ok(r.error("ErrorCode,Could not discover the requested peer"));
    }
    let Ok(mut mon) = dut.ctrl().monitor(intf) else {
        error!("Failed to open monitor on {}", intf);
        return Ok(CmdResult::Error);
    };
    let invite = format!("P2P_INVITE persistent={} peer={}", net.id, peer);
    if dut.ctrl().command(intf, &invite).is_err() {
        info!("Failed to send invitation request");
        return Ok(CmdResult::Error);
    }
    let env = dut.env.clone();
    if wait_for(
        mon.as_mut(),
        &[WpaEvent::InvitationResult],
        env.cfg.event_timeout,
        &env.stop,
    )
    .is_err()
    {
        return Ok(CmdResult::Error);
    }

    let plan = SessionPlan::new(dut);
    let Some(ip) = plan.go_peer(intf, None, plan.ip_wait()) else {
        error!("Could not get peer IP");
        return Ok(CmdResult::Error);
    };
    plan.start(&ip);
    Ok(CmdResult::Success)
}
