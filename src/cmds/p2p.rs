//! Wi-Fi Direct (P2P) commands.
use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cmds::miracast;
use crate::dhcp::{start_dhcp, stop_dhcp};
use crate::dispatch::{CommandTable, Reply};
use crate::dut::{Dut, DutEnv, P2pGroup, WpsMethod, channel_to_freq};
use crate::netcfg;
use crate::proto::command::{CmdResult, Command};
use crate::wpa::events::{
    GroupRole, GroupStarted, WaitError, WpaEvent, invitation_status, wait_for,
};
use crate::wpa::{CtrlExt, EventMonitor, list_networks};

pub fn register(t: &mut CommandTable) {
    t.register(
        "sta_get_p2p_dev_address",
        Some(|c| c.has("interface")),
        sta_get_p2p_dev_address,
    );
    t.register("sta_set_p2p", Some(|c| c.has("interface")), sta_set_p2p);
    t.register(
        "sta_start_autonomous_go",
        Some(|c| c.has("interface") && c.has("OPER_CHN")),
        sta_start_autonomous_go,
    );
    t.register(
        "sta_p2p_connect",
        Some(|c| c.has("interface") && c.has("GroupID") && c.has("P2PDevID")),
        sta_p2p_connect,
    );
    t.register(
        "sta_p2p_start_group_formation",
        Some(|c| {
            c.has("interface")
                && c.has("P2PDevID")
                && c.has("intent_val")
                && c.has("init_go_neg")
        }),
        sta_p2p_start_group_formation,
    );
    t.register(
        "sta_p2p_dissolve",
        Some(|c| c.has("interface") && c.has("GroupID")),
        sta_p2p_dissolve,
    );
    t.register(
        "sta_send_p2p_invitation_req",
        Some(|c| c.has("interface") && c.has("P2PDevID")),
        sta_send_p2p_invitation_req,
    );
    t.register(
        "sta_accept_p2p_invitation_req",
        Some(|c| c.has("interface") && c.has("P2PDevID") && c.has("GroupID")),
        sta_accept_p2p_invitation_req,
    );
    t.register(
        "sta_send_p2p_provision_dis_req",
        Some(|c| c.has("interface") && c.has("ConfigMethod") && c.has("P2PDevID")),
        sta_send_p2p_provision_dis_req,
    );
    t.register("sta_set_wps_pbc", Some(|c| c.has("interface")), sta_set_wps_pbc);
    t.register("sta_wps_read_pin", Some(|c| c.has("interface")), sta_wps_read_pin);
    t.register(
        "sta_wps_enter_pin",
        Some(|c| c.has("interface") && c.has("PIN")),
        sta_wps_enter_pin,
    );
    t.register(
        "sta_get_psk",
        Some(|c| c.has("interface") && c.has("GroupID")),
        sta_get_psk,
    );
    t.register("sta_p2p_reset", Some(|c| c.has("interface")), sta_p2p_reset);
    t.register(
        "sta_get_p2p_ip_config",
        Some(|c| c.has("interface") && c.has("GroupID")),
        sta_get_p2p_ip_config,
    );
}

/// Whether the supplicant already knows `peer`. With `full`, a peer only
/// seen in probe requests does not count.
fn peer_known(env: &DutEnv, ifname: &str, peer: &str, full: bool) -> bool {
    let Ok(reply) = env.ctrl.request(ifname, &format!("P2P_PEER {}", peer)) else {
        return false;
    };
    let same = reply
        .get(..peer.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(peer));
    if !same {
        return false;
    }
    !full || !reply.contains("[PROBE_REQ_ONLY]")
}

/// Make sure `peer` is in the peer table, running device discovery if needed.
pub fn discover_peer(env: &DutEnv, ifname: &str, peer: &str, full: bool) -> bool {
    let p2p_if = env.p2p_ifname_for(ifname);
    if peer_known(env, &p2p_if, peer, full) {
        return true;
    }
    info!("Starting P2P device discovery for {}", peer);
    if env.ctrl.command(&p2p_if, "P2P_FIND type=progressive").is_err() {
        return false;
    }
    let mut found = false;
    for _ in 0..env.cfg.event_timeout.as_secs() {
        env.sleep_secs(1);
        if peer_known(env, &p2p_if, peer, full) {
            found = true;
            break;
        }
    }
    let _ = env.ctrl.command(&p2p_if, "P2P_STOP_FIND");
    if !found {
        info!("Peer {} not found", peer);
    }
    found
}

/// `P2P_CONNECT` suffix for the configured WPS method, plus the bare method
/// name used in provision discovery.
pub fn connect_method(dut: &Dut) -> (String, &'static str) {
    match dut.wps_method {
        WpsMethod::PinDisplay => (format!(" {} display", dut.wps_pin), "display"),
        WpsMethod::PinLabel => (" pin label".to_string(), "label"),
        WpsMethod::PinKeypad => (format!(" {} keypad", dut.wps_pin), "keypad"),
        WpsMethod::Pbc | WpsMethod::NotReady => (" pbc".to_string(), "pbc"),
    }
}

/// Wait for the outcome of group formation on `mon`.
fn wait_group(
    dut: &Dut,
    mon: &mut dyn EventMonitor,
) -> Result<(WpaEvent, String), WaitError> {
    wait_for(
        mon,
        &[
            WpaEvent::GroupStarted,
            WpaEvent::GoNegFailure,
            WpaEvent::GroupFormationFailure,
        ],
        dut.env.cfg.event_timeout,
        &dut.env.stop,
    )
}

/// Remember a started group and bring up DHCP on it.
fn record_group(dut: &mut Dut, p2p_if: &str, g: &GroupStarted, dhcp: bool) -> String {
    let own = dut
        .ctrl()
        .status_field(p2p_if, "p2p_device_address")
        .ok()
        .flatten()
        .unwrap_or_default();
    let grpid = g.group_id(&own);
    info!("Group {} started on {} as {}", grpid, g.ifname, g.role.as_wfa());
    dut.add_group(P2pGroup {
        ifname: g.ifname.clone(),
        grpid: grpid.clone(),
        ssid: g.ssid.clone(),
        role: g.role,
        passphrase: g.passphrase.clone(),
    });
    if dhcp && !dut.env.cfg.internal_dhcp {
        start_dhcp(&dut.env, &g.ifname, g.role);
    }
    grpid
}

fn sta_get_p2p_dev_address(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let Some(addr) = dut.ctrl().status_field(&p2p_if, "p2p_device_address")? else {
        return Ok(CmdResult::Error);
    };
    Ok(r.complete(&format!("DevID,{}", addr)))
}

fn sta_set_p2p(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);

    if let Some(chn) = c.get_int("Listen_Chn") {
        let Ok(chn) = u32::try_from(chn) else {
            return Ok(CmdResult::Invalid);
        };
        if dut
            .ctrl()
            .command(&p2p_if, &format!("P2P_SET listen_channel {}", chn))
            .is_err()
        {
            return Ok(CmdResult::Error);
        }
        dut.listen_chn = chn;
    }

    if let Some(ext) = c.get_int("Ext_Listen_Time_Interval") {
        let period = c.get_int("Ext_Listen_Time_Period").unwrap_or(0);
        let cmd = format!("P2P_EXT_LISTEN {} {}", period, ext);
        if dut.ctrl().command(&p2p_if, &cmd).is_err() {
            return Ok(CmdResult::Error);
        }
    }

    if let Some(mode) = c.get("P2PMode") {
        let ok = match mode.to_ascii_lowercase().as_str() {
            "listen" => {
                let _ = dut.ctrl().command(&p2p_if, "P2P_SET disabled 0");
                dut.ctrl().command(&p2p_if, "P2P_LISTEN").is_ok()
            }
            "discover" => dut.ctrl().command(&p2p_if, "P2P_FIND").is_ok(),
            "idle" => dut.ctrl().command(&p2p_if, "P2P_STOP_FIND").is_ok(),
            "disable" => dut.ctrl().command(&p2p_if, "P2P_SET disabled 1").is_ok(),
            _ => return Ok(r.invalid("errorCode,Unsupported P2PMode")),
        };
        if !ok {
            return Ok(CmdResult::Error);
        }
    }

    if let Some(p) = c.get_bool("Persistent") {
        dut.persistent = p;
    }

    if let Some(intra) = c.get_bool("Intra_BSS") {
        let cmd = format!("P2P_SET intra_bss {}", intra as i32);
        if dut.ctrl().command(&p2p_if, &cmd).is_err() {
            return Ok(CmdResult::Error);
        }
    }

    if let Some(cross) = c.get_bool("crossconnection") {
        let cmd = format!("P2P_SET cross_connect {}", cross as i32);
        if dut.ctrl().command(&p2p_if, &cmd).is_err() {
            return Ok(CmdResult::Error);
        }
    }

    if c.has("Concurrency") {
        // Station and P2P always run side by side here.
        debug!("Concurrency: nothing to configure");
    }

    Ok(CmdResult::Success)
}

fn sta_start_autonomous_go(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let Some(freq) = c
        .get_int("OPER_CHN")
        .and_then(|ch| u32::try_from(ch).ok())
        .and_then(channel_to_freq)
    else {
        return Ok(r.error("errorCode,Unsupported channel"));
    };

    let mut mon = match dut.ctrl().monitor(&p2p_if) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to open monitor on {}: {}", p2p_if, e);
            return Ok(CmdResult::Error);
        }
    };
    let persistent = if dut.persistent { "persistent " } else { "" };
    let cmd = format!("P2P_GROUP_ADD {}freq={}", persistent, freq);
    if dut.ctrl().command(&p2p_if, &cmd).is_err() {
        return Ok(r.error("errorCode,Failed to start autonomous GO"));
    }

    let body = match wait_for(
        mon.as_mut(),
        &[WpaEvent::GroupStarted],
        dut.env.cfg.event_timeout,
        &dut.env.stop,
    ) {
        Ok((_, body)) => body,
        Err(e) => {
            info!("GO start: {}", e);
            return Ok(r.error("errorCode,GO starting timed out"));
        }
    };
    let Some(group) = GroupStarted::parse(&body) else {
        return Ok(r.error("errorCode,Unexpected group start event"));
    };

    let wfd = dut.program.is_wfd();
    let grpid = record_group(dut, &p2p_if, &group, !wfd);
    if wfd {
        miracast::start_autonomous_go(dut, &group.ifname)?;
    }
    Ok(r.complete(&format!("GroupID,{}", grpid)))
}

fn sta_p2p_connect(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let dev_id = c.get("P2PDevID").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);

    if !discover_peer(&dut.env, intf, dev_id, false) {
        return Ok(r.error("errorCode,Could not find peer"));
    }
    let (method, _) = connect_method(dut);
    let mut mon = match dut.ctrl().monitor(&p2p_if) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to open monitor on {}: {}", p2p_if, e);
            return Ok(CmdResult::Error);
        }
    };
    let cmd = format!("P2P_CONNECT {}{} join", dev_id, method);
    if dut.ctrl().command(&p2p_if, &cmd).is_err() {
        return Ok(r.error("errorCode,Failed to join the group"));
    }

    match wait_group(dut, mon.as_mut()) {
        Ok((WpaEvent::GroupStarted, body)) => {
            let Some(group) = GroupStarted::parse(&body) else {
                return Ok(r.error("errorCode,Unexpected group start event"));
            };
            record_group(dut, &p2p_if, &group, true);
            Ok(CmdResult::Success)
        }
        Ok((_, body)) => {
            info!("Group join failed: {}", body);
            Ok(r.error("errorCode,Group joining failed"))
        }
        Err(e) => {
            info!("Group join: {}", e);
            Ok(r.error("errorCode,Group joining did not complete"))
        }
    }
}

fn sta_p2p_start_group_formation(
    dut: &mut Dut,
    r: &mut Reply<'_>,
    c: &Command,
) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let dev_id = c.get("P2PDevID").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let Some(intent) = c.get_int("intent_val").filter(|i| (0..=15).contains(i)) else {
        return Ok(CmdResult::Invalid);
    };
    let init_go_neg = c.get_int("init_go_neg").unwrap_or(0) != 0;

    if !discover_peer(&dut.env, intf, dev_id, false) {
        return Ok(r.error("errorCode,Could not find peer"));
    }

    let (method, _) = connect_method(dut);
    let mut cmd = format!("P2P_CONNECT {}{}", dev_id, method);
    if dut.persistent {
        cmd.push_str(" persistent");
    }
    cmd.push_str(&format!(" go_intent={}", intent));
    if let Some(freq) = c
        .get_int("oper_chn")
        .and_then(|ch| u32::try_from(ch).ok())
        .and_then(channel_to_freq)
    {
        cmd.push_str(&format!(" freq={}", freq));
    }
    if !init_go_neg {
        cmd.push_str(" auth");
    }

    let mut mon = match dut.ctrl().monitor(&p2p_if) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to open monitor on {}: {}", p2p_if, e);
            return Ok(CmdResult::Error);
        }
    };
    if dut.ctrl().command(&p2p_if, &cmd).is_err() {
        return Ok(r.error("errorCode,Failed to start group formation"));
    }

    match wait_group(dut, mon.as_mut()) {
        Ok((WpaEvent::GroupStarted, body)) => {
            let Some(group) = GroupStarted::parse(&body) else {
                return Ok(r.error("errorCode,Unexpected group start event"));
            };
            let grpid = record_group(dut, &p2p_if, &group, true);
            Ok(r.complete(&format!("Result,{},GroupID,{}", group.role.as_wfa(), grpid)))
        }
        Ok((WpaEvent::GoNegFailure, body)) => {
            info!("GO negotiation failed: {}", body);
            Ok(r.complete("Result,FAIL"))
        }
        Ok((_, body)) => {
            info!("Group formation failed: {}", body);
            Ok(r.error("errorCode,Group formation failed"))
        }
        Err(e) => {
            info!("Group formation: {}", e);
            Ok(r.error("errorCode,Group formation did not complete"))
        }
    }
}

fn sta_p2p_dissolve(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let grpid = c.get("GroupID").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let Some(group) = dut.find_group(grpid).cloned() else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };

    let mon = dut.ctrl().monitor(&p2p_if);
    if dut
        .ctrl()
        .command(&p2p_if, &format!("P2P_GROUP_REMOVE {}", group.ifname))
        .is_err()
    {
        return Ok(CmdResult::Error);
    }
    if let Ok(mut mon) = mon
        && let Err(e) = wait_for(
            mon.as_mut(),
            &[WpaEvent::GroupRemoved],
            dut.env.cfg.event_timeout,
            &dut.env.stop,
        )
    {
        info!("Group removal not confirmed: {}", e);
    }
    if !dut.env.cfg.internal_dhcp {
        stop_dhcp(&dut.env, &group.ifname, group.role);
    }
    dut.remove_group(grpid);
    Ok(CmdResult::Success)
}

/// Network id of the persistent group stored for `ssid`.
fn persistent_network(dut: &Dut, ifname: &str, ssid: &str) -> Option<u32> {
    let list = dut.ctrl().request(ifname, "LIST_NETWORKS").ok()?;
    list_networks(&list)
        .into_iter()
        .find(|n| n.ssid == ssid && n.flags.contains("[P2P-PERSISTENT]"))
        .map(|n| n.id)
}

fn sta_send_p2p_invitation_req(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let dev_id = c.get("P2PDevID").unwrap_or_default();
    let grpid = c.get("GroupID");
    let reinvoke = c.get_bool("Reinvoke").unwrap_or(false);
    let p2p_if = dut.env.p2p_ifname_for(intf);

    let invite = if reinvoke {
        let Some(ssid) = grpid.and_then(|g| g.split_once(' ')).map(|(_, s)| s) else {
            return Ok(CmdResult::Invalid);
        };
        let Some(id) = persistent_network(dut, &p2p_if, ssid) else {
            return Ok(r.error("errorCode,Persistent group credentials not found"));
        };
        format!("P2P_INVITE persistent={} peer={}", id, dev_id)
    } else {
        let Some(group) = grpid.and_then(|g| dut.find_group(g)) else {
            return Ok(r.error("errorCode,Unknown GroupID"));
        };
        format!("P2P_INVITE group={} peer={}", group.ifname, dev_id)
    };

    if !discover_peer(&dut.env, intf, dev_id, false) {
        return Ok(r.error("errorCode,Could not find peer"));
    }
    let mon = dut.ctrl().monitor(&p2p_if);
    if dut.ctrl().command(&p2p_if, &invite).is_err() {
        return Ok(r.error("errorCode,Failed to send invitation request"));
    }
    if let Ok(mut mon) = mon {
        match wait_for(
            mon.as_mut(),
            &[WpaEvent::InvitationResult],
            dut.env.cfg.event_timeout,
            &dut.env.stop,
        ) {
            Ok((_, body)) => {
                let status = invitation_status(&body);
                debug!("Invitation result status {:?}", status);
                if status.is_some_and(|s| s != 0) {
                    return Ok(r.error("errorCode,Invitation rejected"));
                }
            }
            Err(e) => info!("Invitation result not seen: {}", e),
        }
    }
    Ok(CmdResult::Success)
}

fn sta_accept_p2p_invitation_req(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let dev_id = c.get("P2PDevID").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);

    if c.get_bool("Reinvoke").unwrap_or(false) {
        // Persistent reconnect takes care of re-invocations.
        return Ok(CmdResult::Success);
    }
    let cred = match dut.wps_method {
        WpsMethod::PinDisplay | WpsMethod::PinKeypad | WpsMethod::PinLabel => dut.wps_pin.clone(),
        _ => "pbc".to_string(),
    };
    let cmd = format!("P2P_CONNECT {} {} join auth", dev_id, cred);
    if dut.ctrl().command(&p2p_if, &cmd).is_err() {
        return Ok(r.error("errorCode,Failed to authorize join"));
    }
    Ok(CmdResult::Success)
}

fn sta_send_p2p_provision_dis_req(
    dut: &mut Dut,
    r: &mut Reply<'_>,
    c: &Command,
) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let dev_id = c.get("P2PDevID").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let method = match c.get("ConfigMethod").unwrap_or_default().to_ascii_lowercase().as_str() {
        "display" => "display",
        "keypad" => "keypad",
        "label" => "label",
        "pbc" | "pushbutton" => "pbc",
        _ => return Ok(r.error("errorCode,Unsupported ConfigMethod")),
    };

    if !discover_peer(&dut.env, intf, dev_id, false) {
        return Ok(r.error("errorCode,Could not find peer"));
    }
    let cmd = format!("P2P_PROV_DISC {} {}", dev_id, method);
    if dut.ctrl().command(&p2p_if, &cmd).is_err() {
        return Ok(r.error("errorCode,Failed to send provision discovery request"));
    }
    Ok(CmdResult::Success)
}

/// The GO group named by an optional `GroupID`; `Err` when the id is unknown.
fn go_group(dut: &Dut, c: &Command) -> Result<Option<P2pGroup>, ()> {
    let Some(grpid) = c.get("GroupID") else {
        return Ok(None);
    };
    let group = dut.find_group(grpid).cloned().ok_or(())?;
    Ok((group.role == GroupRole::Go).then_some(group))
}

fn sta_set_wps_pbc(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Ok(group) = go_group(dut, c) else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };
    dut.wps_method = WpsMethod::Pbc;
    if let Some(group) = group
        && dut.ctrl().command(&group.ifname, "WPS_PBC").is_err()
    {
        return Ok(r.error("errorCode,Failed to start WPS PBC"));
    }
    Ok(CmdResult::Success)
}

fn sta_wps_read_pin(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);
    let Ok(group) = go_group(dut, c) else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };

    let pin = dut.ctrl().query(&p2p_if, "WPS_PIN get")?;
    if let Some(group) = group
        && dut
            .ctrl()
            .command(&group.ifname, &format!("WPS_PIN any {}", pin))
            .is_err()
    {
        return Ok(r.error("errorCode,Failed to start WPS PIN"));
    }
    dut.wps_pin = pin.clone();
    dut.wps_method = WpsMethod::PinDisplay;
    Ok(r.complete(&format!("PIN,{}", pin)))
}

fn sta_wps_enter_pin(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let pin = c.get("PIN").unwrap_or_default().to_string();
    let Ok(group) = go_group(dut, c) else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };
    if let Some(group) = group
        && dut
            .ctrl()
            .command(&group.ifname, &format!("WPS_PIN any {}", pin))
            .is_err()
    {
        return Ok(r.error("errorCode,Failed to start WPS PIN"));
    }
    dut.wps_pin = pin;
    dut.wps_method = WpsMethod::PinKeypad;
    Ok(CmdResult::Success)
}

fn sta_get_psk(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let grpid = c.get("GroupID").unwrap_or_default();
    let Some(group) = dut.find_group(grpid).cloned() else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };
    if group.role != GroupRole::Go {
        return Ok(r.error("errorCode,Local role is not GO in the specified group"));
    }
    let psk = match group.passphrase {
        Some(p) => p,
        None => dut.ctrl().query(&group.ifname, "P2P_GET_PASSPHRASE")?,
    };
    Ok(r.complete(&format!("passPhrase,{},SSID,{}", psk, group.ssid)))
}

pub fn sta_p2p_reset(dut: &mut Dut, _r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let p2p_if = dut.env.p2p_ifname_for(intf);

    for group in std::mem::take(&mut dut.groups) {
        debug!("Removing group {} ({})", group.grpid, group.ifname);
        let _ = dut
            .ctrl()
            .command(&p2p_if, &format!("P2P_GROUP_REMOVE {}", group.ifname));
        if !dut.env.cfg.internal_dhcp {
            stop_dhcp(&dut.env, &group.ifname, group.role);
        }
    }

    dut.wps_method = WpsMethod::NotReady;
    dut.wps_pin.clear();
    dut.persistent = false;
    dut.listen_chn = 6;
    dut.peer_mac_address.clear();

    let ctrl = dut.ctrl();
    for cmd in [
        "P2P_STOP_FIND",
        "P2P_FLUSH",
        "P2P_SERVICE_FLUSH",
        "P2P_SET disabled 0",
        "P2P_SET ssid_postfix ",
        "P2P_SET listen_channel 6",
        "P2P_EXT_LISTEN",
        "SET p2p_go_intent 7",
        "SET persistent_reconnect 1",
    ] {
        let _ = ctrl.command(&p2p_if, cmd);
    }
    ctrl.remove_networks(&p2p_if);

    if dut.program.is_wfd() {
        miracast::set_wfd_ie(dut);
    } else {
        let _ = dut.ctrl().command(&p2p_if, "SET wifi_display 0");
    }
    Ok(CmdResult::Success)
}

fn sta_get_p2p_ip_config(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let grpid = c.get("GroupID").unwrap_or_default();
    let Some(group) = dut.find_group(grpid).cloned() else {
        return Ok(r.error("errorCode,Unknown GroupID"));
    };
    if group.role == GroupRole::Client {
        dut.env.wait_ip_addr(&group.ifname, 15);
    }
    let resp = netcfg::ipv4_config(&dut.env, &group.ifname);
    Ok(r.complete(&resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmds::testing::last;
    use crate::dut::tests::wlan0_dut;
    use crate::testutil::FakeCtrl;

    const PEER: &str = "02:00:00:00:00:02";
    const GO_STARTED: &str = "<3>P2P-GROUP-STARTED p2p-wlan0-0 GO ssid=\"DIRECT-xy\" freq=2412 passphrase=\"abcd1234\" go_dev_addr=02:00:00:00:00:01";

    fn with_peer(ctrl: &FakeCtrl) {
        ctrl.reply(&format!("P2P_PEER {}", PEER), "02:00:00:00:00:02\nage=1\n");
    }

    #[test]
    fn dev_address() {
        let (mut dut, ctrl, _) = wlan0_dut();
        ctrl.reply("STATUS", "p2p_device_address=02:00:00:00:00:01\n");
        assert_eq!(
            last(&mut dut, "sta_get_p2p_dev_address,interface,wlan0"),
            "status,COMPLETE,DevID,02:00:00:00:00:01"
        );
        ctrl.reply("STATUS", "wpa_state=DISCONNECTED\n");
        assert_eq!(last(&mut dut, "sta_get_p2p_dev_address,interface,wlan0"), "status,ERROR");
    }

    #[test]
    fn discovery_runs_until_found() {
        let (dut, ctrl, _) = wlan0_dut();
        ctrl.reply_once(&format!("P2P_PEER {}", PEER), "FAIL\n");
        ctrl.reply_once(&format!("P2P_PEER {}", PEER), "FAIL\n");
        with_peer(&ctrl);
        assert!(discover_peer(&dut.env, "wlan0", PEER, true));
        assert!(ctrl.was_sent("P2P_FIND type=progressive"));
        assert!(ctrl.was_sent("P2P_STOP_FIND"));
    }

    #[test]
    fn probe_only_peer_needs_full_discovery() {
        let (dut, ctrl, _) = wlan0_dut();
        ctrl.reply(
            &format!("P2P_PEER {}", PEER),
            "02:00:00:00:00:02\nflags=[PROBE_REQ_ONLY]\n",
        );
        assert!(peer_known(&dut.env, "wlan0", PEER, false));
        assert!(!peer_known(&dut.env, "wlan0", PEER, true));
        assert!(!discover_peer(&dut.env, "wlan0", PEER, true));
    }

    #[test]
    fn set_p2p_options() {
        let (mut dut, ctrl, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "sta_set_p2p,interface,wlan0,Listen_Chn,11,P2PMode,Listen,Persistent,1,Intra_BSS,0"),
            "status,COMPLETE"
        );
        assert_eq!(dut.listen_chn, 11);
        assert!(dut.persistent);
        assert!(ctrl.was_sent("P2P_SET listen_channel 11"));
        assert!(ctrl.was_sent("P2P_LISTEN"));
        assert!(ctrl.was_sent("P2P_SET intra_bss 0"));
        assert_eq!(
            last(&mut dut, "sta_set_p2p,interface,wlan0,P2PMode,Sleep"),
            "status,INVALID,errorCode,Unsupported P2PMode"
        );
        ctrl.reply("P2P_FIND", "FAIL\n");
        assert_eq!(last(&mut dut, "sta_set_p2p,interface,wlan0,P2PMode,Discover"), "status,ERROR");
    }

    #[test]
    fn autonomous_go() {
        let (mut dut, ctrl, host) = wlan0_dut();
        dut.persistent = true;
        ctrl.event("wlan0", GO_STARTED);
        assert_eq!(
            last(&mut dut, "sta_start_autonomous_go,interface,wlan0,OPER_CHN,6"),
            "status,COMPLETE,GroupID,02:00:00:00:00:01 DIRECT-xy"
        );
        assert!(ctrl.was_sent("P2P_GROUP_ADD persistent freq=2437"));
        assert!(host.ran_prefix("ifconfig p2p-wlan0-0 192.168.43.1"));
        let g = dut.find_group("02:00:00:00:00:01 DIRECT-xy").unwrap();
        assert_eq!(g.role, GroupRole::Go);

        assert_eq!(
            last(&mut dut, "sta_get_psk,interface,wlan0,GroupID,02:00:00:00:00:01 DIRECT-xy"),
            "status,COMPLETE,passPhrase,abcd1234,SSID,DIRECT-xy"
        );
    }

    #[test]
    fn autonomous_go_timeout() {
        let (mut dut, _, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "sta_start_autonomous_go,interface,wlan0,OPER_CHN,1"),
            "status,ERROR,errorCode,GO starting timed out"
        );
        assert!(dut.groups.is_empty());
    }

    #[test]
    fn group_formation_as_client() {
        let (mut dut, ctrl, host) = wlan0_dut();
        with_peer(&ctrl);
        dut.wps_method = WpsMethod::PinDisplay;
        dut.wps_pin = "12345670".into();
        ctrl.event(
            "wlan0",
            "<3>P2P-GROUP-STARTED p2p-wlan0-1 client ssid=\"DIRECT-cd\" freq=2412 go_dev_addr=02:00:00:00:00:02",
        );
        assert_eq!(
            last(
                &mut dut,
                &format!("sta_p2p_start_group_formation,interface,wlan0,P2PDevID,{},intent_val,3,init_go_neg,1,oper_chn,1", PEER)
            ),
            "status,COMPLETE,Result,CLIENT,GroupID,02:00:00:00:00:02 DIRECT-cd"
        );
        assert!(ctrl.was_sent(&format!("P2P_CONNECT {} 12345670 display go_intent=3 freq=2412", PEER)));
        assert!(host.ran_prefix("dhclient -nw -pf /var/run/dhclient-p2p-wlan0-1.pid p2p-wlan0-1"));
    }

    #[test]
    fn group_formation_negotiation_failure() {
        let (mut dut, ctrl, _) = wlan0_dut();
        with_peer(&ctrl);
        ctrl.event("wlan0", "<3>P2P-GO-NEG-FAILURE status=9");
        assert_eq!(
            last(
                &mut dut,
                &format!("sta_p2p_start_group_formation,interface,wlan0,P2PDevID,{},intent_val,15,init_go_neg,0", PEER)
            ),
            "status,COMPLETE,Result,FAIL"
        );
        assert!(ctrl.was_sent(&format!("P2P_CONNECT {} pbc go_intent=15 auth", PEER)));
    }

    #[test]
    fn dissolve_known_group() {
        let (mut dut, ctrl, host) = wlan0_dut();
        dut.add_group(P2pGroup {
            ifname: "p2p-wlan0-0".into(),
            grpid: "02:00:00:00:00:01 DIRECT-xy".into(),
            ssid: "DIRECT-xy".into(),
            role: GroupRole::Go,
            passphrase: None,
        });
        host.add_file("/tmp/sigma_dut-dnsmasq-p2p-wlan0-0.pid", "5");
        ctrl.event("wlan0", "<3>P2P-GROUP-REMOVED p2p-wlan0-0 GO reason=REQUESTED");
        assert_eq!(
            last(&mut dut, "sta_p2p_dissolve,interface,wlan0,GroupID,02:00:00:00:00:01 DIRECT-xy"),
            "status,COMPLETE"
        );
        assert!(ctrl.was_sent("P2P_GROUP_REMOVE p2p-wlan0-0"));
        assert!(host.ran_prefix("kill `cat /tmp/sigma_dut-dnsmasq-p2p-wlan0-0.pid`"));
        assert!(dut.groups.is_empty());
        assert_eq!(
            last(&mut dut, "sta_p2p_dissolve,interface,wlan0,GroupID,nope"),
            "status,ERROR,errorCode,Unknown GroupID"
        );
    }

    #[test]
    fn reinvoke_persistent_group() {
        let (mut dut, ctrl, _) = wlan0_dut();
        with_peer(&ctrl);
        ctrl.reply(
            "LIST_NETWORKS",
            "network id / ssid / bssid / flags\n0\thome\tany\t\n4\tDIRECT-xy\t02:00:00:00:00:01\t[DISABLED][P2P-PERSISTENT]\n",
        );
        ctrl.event("wlan0", "<3>P2P-INVITATION-RESULT status=0");
        assert_eq!(
            last(
                &mut dut,
                &format!("sta_send_p2p_invitation_req,interface,wlan0,P2PDevID,{},GroupID,02:00:00:00:00:01 DIRECT-xy,Reinvoke,1", PEER)
            ),
            "status,COMPLETE"
        );
        assert!(ctrl.was_sent(&format!("P2P_INVITE persistent=4 peer={}", PEER)));
    }

    #[test]
    fn provision_discovery_methods() {
        let (mut dut, ctrl, _) = wlan0_dut();
        with_peer(&ctrl);
        assert_eq!(
            last(&mut dut, &format!("sta_send_p2p_provision_dis_req,interface,wlan0,ConfigMethod,Keypad,P2PDevID,{}", PEER)),
            "status,COMPLETE"
        );
        assert!(ctrl.was_sent(&format!("P2P_PROV_DISC {} keypad", PEER)));
        assert_eq!(
            last(&mut dut, &format!("sta_send_p2p_provision_dis_req,interface,wlan0,ConfigMethod,NFC,P2PDevID,{}", PEER)),
            "status,ERROR,errorCode,Unsupported ConfigMethod"
        );
    }

    #[test]
    fn wps_pin_bookkeeping() {
        let (mut dut, ctrl, _) = wlan0_dut();
        ctrl.reply("WPS_PIN get", "49226874\n");
        assert_eq!(
            last(&mut dut, "sta_wps_read_pin,interface,wlan0"),
            "status,COMPLETE,PIN,49226874"
        );
        assert_eq!(dut.wps_method, WpsMethod::PinDisplay);
        assert_eq!(last(&mut dut, "sta_wps_enter_pin,interface,wlan0,PIN,12345670"), "status,COMPLETE");
        assert_eq!(dut.wps_pin, "12345670");
        assert_eq!(dut.wps_method, WpsMethod::PinKeypad);
        assert_eq!(
            last(&mut dut, "sta_set_wps_pbc,interface,wlan0,GroupID,unknown"),
            "status,ERROR,errorCode,Unknown GroupID"
        );
        assert_eq!(last(&mut dut, "sta_set_wps_pbc,interface,wlan0"), "status,COMPLETE");
        assert_eq!(dut.wps_method, WpsMethod::Pbc);
    }

    #[test]
    fn accept_invitation_authorizes_join() {
        let (mut dut, ctrl, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, &format!("sta_accept_p2p_invitation_req,interface,wlan0,P2PDevID,{},GroupID,x y", PEER)),
            "status,COMPLETE"
        );
        assert!(ctrl.was_sent(&format!("P2P_CONNECT {} pbc join auth", PEER)));
    }

    #[test]
    fn reset_clears_groups_and_state() {
        let (mut dut, ctrl, _) = wlan0_dut();
        dut.persistent = true;
        dut.wps_method = WpsMethod::Pbc;
        dut.add_group(P2pGroup {
            ifname: "p2p-wlan0-3".into(),
            grpid: "a b".into(),
            ssid: "b".into(),
            role: GroupRole::Client,
            passphrase: None,
        });
        assert_eq!(last(&mut dut, "sta_p2p_reset,interface,wlan0"), "status,COMPLETE");
        assert!(dut.groups.is_empty());
        assert!(!dut.persistent);
        assert_eq!(dut.wps_method, WpsMethod::NotReady);
        assert!(ctrl.was_sent("P2P_GROUP_REMOVE p2p-wlan0-3"));
        assert!(ctrl.was_sent("P2P_FLUSH"));
        assert!(ctrl.was_sent("SET wifi_display 0"));
    }

    #[test]
    fn p2p_ip_config_for_group() {
        let (mut dut, _, host) = wlan0_dut();
        dut.add_group(P2pGroup {
            ifname: "p2p-wlan0-0".into(),
            grpid: "g".into(),
            ssid: "DIRECT-g".into(),
            role: GroupRole::Go,
            passphrase: None,
        });
        host.output_for(
            "ip -4 -o addr show dev p2p-wlan0-0",
            "9: p2p-wlan0-0    inet 192.168.43.1/24 brd 192.168.43.255 scope global p2p-wlan0-0\n",
        );
        host.exit_code("ps ax", 1);
        assert_eq!(
            last(&mut dut, "sta_get_p2p_ip_config,interface,wlan0,GroupID,g"),
            "status,COMPLETE,dhcp,0,ip,192.168.43.1,mask,255.255.255.0,primary-dns,0.0.0.0"
        );
    }
}
