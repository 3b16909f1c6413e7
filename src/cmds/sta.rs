//! Infrastructure station commands: network profiles, association and resets.
use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cmds::{has_interface, ip, miracast, p2p};
use crate::dispatch::{CommandTable, Reply};
use crate::dut::{DeviceType, DriverType, Dut, Pmf, Program, WpsMethod, channel_to_freq};
use crate::netcfg::{is_ifname, is_mac_addr};
use crate::proto::command::{CmdResult, Command};
use crate::wpa::CtrlExt;
use crate::wpa::events::{WpaEvent, wait_for};

const STA_VENDOR: &str = "Atheros";
const NO_BSSID: &str = "00:00:00:00:00:00";

/// Outcome of a setup step: the value to carry on with, or the result the
/// handler should return right away.
type Step<T> = std::result::Result<T, CmdResult>;

pub fn register(t: &mut CommandTable) {
    t.register("sta_get_info", Some(has_interface), sta_get_info);
    t.register("sta_get_mac_address", Some(has_interface), sta_get_mac_address);
    t.register("sta_is_connected", Some(has_interface), sta_is_connected);
    t.register("sta_get_bssid", Some(has_interface), sta_get_bssid);
    t.register(
        "sta_set_encryption",
        Some(|c| c.has("interface") && c.has("ssid") && c.has("encpType")),
        sta_set_encryption,
    );
    t.register(
        "sta_set_psk",
        Some(|c| c.has("interface") && c.has("ssid")),
        sta_set_psk,
    );
    t.register(
        "sta_set_security",
        Some(|c| c.has("interface") && c.has("ssid")),
        sta_set_security,
    );
    t.register(
        "sta_associate",
        Some(|c| c.has("interface") && c.has("ssid")),
        sta_associate,
    );
    t.register("sta_disconnect", Some(has_interface), sta_disconnect);
    t.register("sta_reassoc", Some(has_interface), sta_reassoc);
    t.register("sta_reassociate", Some(has_interface), sta_reassoc);
    t.register("sta_scan", Some(has_interface), sta_scan);
    t.register("sta_reset_default", Some(has_interface), sta_reset_default);
    t.register(
        "sta_preset_testparameters",
        Some(has_interface),
        sta_preset_testparameters,
    );
    t.register(
        "sta_get_parameter",
        Some(|c| c.has("interface") && c.has("Program")),
        sta_get_parameter,
    );
    t.register("sta_set_parameter", Some(has_interface), sta_set_parameter);
    t.register(
        "sta_set_macaddr",
        Some(|c| c.has("interface") && c.has("MAC")),
        sta_set_macaddr,
    );
}

fn station(dut: &Dut, c: &Command) -> String {
    dut.env.sta_ifname_for(c.get("interface").unwrap_or_default())
}

fn sta_get_info(_dut: &mut Dut, r: &mut Reply<'_>, _c: &Command) -> Result<CmdResult> {
    Ok(r.complete(&format!("vendor,{}", STA_VENDOR)))
}

fn sta_get_mac_address(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    match dut.ctrl().status_field(&ifname, "address") {
        Ok(Some(addr)) => Ok(r.complete(&format!("mac,{}", addr))),
        _ => Ok(CmdResult::Error),
    }
}

fn sta_is_connected(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let Ok(state) = dut.ctrl().status_field(&ifname, "wpa_state") else {
        return Ok(CmdResult::Error);
    };
    let connected = state.is_some_and(|s| s.starts_with("COMPLETED"));
    Ok(r.complete(&format!("connected,{}", connected as i32)))
}

fn sta_get_bssid(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let bssid = dut
        .ctrl()
        .status_field(&ifname, "bssid")
        .ok()
        .flatten()
        .unwrap_or_else(|| NO_BSSID.to_string());
    Ok(r.complete(&format!("bssid,{}", bssid)))
}

/// New network block for `ssid`, remembered as the infrastructure network.
fn add_network_common(dut: &mut Dut, r: &mut Reply<'_>, c: &Command, ifname: &str) -> Result<Step<u32>> {
    let Some(ssid) = c.get("ssid") else {
        return Ok(Err(CmdResult::Invalid));
    };
    dut.start_sta_mode()?;
    let id = dut.ctrl().add_network(ifname)?;
    if dut.ctrl().set_network_quoted(ifname, id, "ssid", ssid).is_err() {
        return Ok(Err(r.error("errorCode,Failed to set network ssid")));
    }
    dut.infra_network_id = id;
    dut.infra_ssid = ssid.to_string();
    debug!("network {} for '{}' on {}", id, ssid, ifname);

    if matches!(dut.program, Program::Hs2 | Program::Hs2R2) {
        let _ = dut.ctrl().command(ifname, &format!("ENABLE_NETWORK {} no-connect", id));
    }
    if c.get_int("prefer").is_some_and(|p| p > 0) {
        dut.ctrl().set_network(ifname, id, "priority", "1")?;
    }
    Ok(Ok(id))
}

fn sta_set_encryption(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let id = match add_network_common(dut, r, c, &ifname)? {
        Ok(id) => id,
        Err(done) => return Ok(done),
    };
    let ctrl = dut.ctrl();
    ctrl.set_network(&ifname, id, "key_mgmt", "NONE")?;

    if c.is("encpType", "wep") {
        if let Some(active) = c.get("activeKey") {
            let idx = match active.trim().parse::<u32>() {
                Ok(k @ 1..=4) => k - 1,
                _ => return Ok(CmdResult::Invalid),
            };
            ctrl.set_network(&ifname, id, "wep_tx_keyidx", &idx.to_string())?;
        }
        for k in 1..=4 {
            if let Some(key) = c.get(&format!("key{}", k)) {
                ctrl.set_network(&ifname, id, &format!("wep_key{}", k - 1), key)?;
            }
        }
    }
    Ok(CmdResult::Success)
}

/// Protocol, cipher and PMF settings shared by the personal security modes.
fn set_wpa_common(dut: &mut Dut, r: &mut Reply<'_>, c: &Command, ifname: &str) -> Result<Step<u32>> {
    let id = match add_network_common(dut, r, c, ifname)? {
        Ok(id) => id,
        Err(done) => return Ok(Err(done)),
    };

    let Some(kmt) = c.get("keyMgmtType") else {
        return Ok(Err(r.invalid("errorCode,Missing keyMgmtType")));
    };
    let proto = match kmt.to_ascii_lowercase().as_str() {
        "wpa" | "wpa-psk" => "WPA",
        "wpa2" | "wpa2-psk" | "wpa2-ft" | "wpa2-sha256" => "WPA2",
        "wpa2-wpa-psk" | "wpa2-wpa-ent" => "WPA WPA2",
        _ => return Ok(Err(r.invalid("errorCode,Unrecognized keyMgmtType value"))),
    };
    dut.ctrl().set_network(ifname, id, "proto", proto)?;

    let Some(encp) = c.get("encpType") else {
        return Ok(Err(r.invalid("errorCode,Missing encpType")));
    };
    let ctrl = dut.ctrl();
    match encp.to_ascii_lowercase().as_str() {
        "tkip" => ctrl.set_network(ifname, id, "pairwise", "TKIP")?,
        "aes-ccmp" => ctrl.set_network(ifname, id, "pairwise", "CCMP")?,
        "aes-ccmp-tkip" => ctrl.set_network(ifname, id, "pairwise", "CCMP TKIP")?,
        "aes-gcmp" => {
            ctrl.set_network(ifname, id, "pairwise", "GCMP")?;
            ctrl.set_network(ifname, id, "group", "GCMP")?;
        }
        _ => return Ok(Err(r.invalid("errorCode,Unrecognized encpType value"))),
    }

    dut.sta_pmf = Pmf::Disabled;
    if let Some(pmf) = c.get("PMF") {
        dut.sta_pmf = match pmf.to_ascii_lowercase().as_str() {
            "required" | "forced_required" => Pmf::Required,
            "optional" => Pmf::Optional,
            "disabled" | "forced_disabled" => Pmf::Disabled,
            _ => return Ok(Err(r.invalid("errorCode,Unrecognized PMF value"))),
        };
        match dut.sta_pmf {
            Pmf::Required => dut.ctrl().set_network(ifname, id, "ieee80211w", "2")?,
            Pmf::Optional => dut.ctrl().set_network(ifname, id, "ieee80211w", "1")?,
            Pmf::Disabled => {}
        }
    }
    Ok(Ok(id))
}

fn psk_key_mgmt(dut: &Dut, c: &Command) -> &'static str {
    let ft = c.is("keyMgmtType", "wpa2-ft");
    if c.is("Type", "SAE") {
        return if ft { "FT-SAE" } else { "SAE" };
    }
    if c.is("micAlg", "SHA-256") {
        return "WPA-PSK-SHA256";
    }
    if c.is("micAlg", "SHA-1") {
        return "WPA-PSK";
    }
    if ft {
        return "FT-PSK";
    }
    if c.is("keyMgmtType", "wpa2-sha256") || dut.sta_pmf != Pmf::Disabled {
        return "WPA-PSK WPA-PSK-SHA256";
    }
    "WPA-PSK"
}

fn sta_set_psk(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let id = match set_wpa_common(dut, r, c, &ifname)? {
        Ok(id) => id,
        Err(done) => return Ok(done),
    };

    let key_mgmt = psk_key_mgmt(dut, c);
    let ctrl = dut.ctrl();
    ctrl.set_network(&ifname, id, "key_mgmt", key_mgmt)?;
    if c.is("Type", "SAE") {
        let _ = ctrl.command(&ifname, "SET sae_groups ");
    }

    let Some(pass) = c.get("passPhrase") else {
        return Ok(CmdResult::Invalid);
    };
    ctrl.set_network_quoted(&ifname, id, "psk", pass)?;

    if let Some(group) = c.get("ECGroupID") {
        ctrl.command(&ifname, &format!("SET sae_groups {}", group))?;
    }
    Ok(CmdResult::Success)
}

fn sta_set_security(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Some(kind) = c.get("Type") else {
        return Ok(r.error("ErrorCode,Missing Type argument"));
    };
    match kind.to_ascii_uppercase().as_str() {
        "OPEN" | "WEP" => sta_set_encryption(dut, r, c),
        "PSK" | "SAE" => sta_set_psk(dut, r, c),
        _ => Ok(r.error("ErrorCode,Unsupported Type value")),
    }
}

fn sta_associate(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let ssid = c.get("ssid").unwrap_or_default();

    if let Some(ie) = dut.rsne_override.clone()
        && dut
            .ctrl()
            .command(&ifname, &format!("TEST_ASSOC_IE {}", ie))
            .is_err()
    {
        return Ok(r.error("ErrorCode,Failed to set DEV_CONFIGURE_IE RSNE override"));
    }

    if c.get_bool("WPS") == Some(true) {
        let cmd = match dut.wps_method {
            WpsMethod::NotReady => return Ok(r.error("ErrorCode,WPS parameters not yet set")),
            WpsMethod::Pbc => "WPS_PBC".to_string(),
            _ => format!("WPS_PIN any {}", dut.wps_pin),
        };
        if dut.ctrl().command(&ifname, &cmd).is_err() {
            return Ok(CmdResult::Error);
        }
        return Ok(CmdResult::Success);
    }

    if ssid != dut.infra_ssid {
        debug!("No network parameters known for '{}'", ssid);
        return Ok(r.error("ErrorCode,No network parameters known for network"));
    }
    let id = dut.infra_network_id;
    if let Some(bssid) = c.get("bssid")
        && dut.ctrl().set_network(&ifname, id, "bssid", bssid).is_err()
    {
        return Ok(r.error("ErrorCode,Invalid bssid argument"));
    }

    let mut cmd = format!("SELECT_NETWORK {}", id);
    if let Some(freq) = c
        .get_int("channel")
        .and_then(|ch| u32::try_from(ch).ok())
        .and_then(channel_to_freq)
    {
        cmd.push_str(&format!(" freq={}", freq));
    }
    if dut.ctrl().command(&ifname, &cmd).is_err() {
        return Ok(CmdResult::Error);
    }
    Ok(CmdResult::Success)
}

fn sta_disconnect(dut: &mut Dut, _r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let ctrl = dut.ctrl();
    if let Err(e) = ctrl.command(&ifname, "DISCONNECT") {
        debug!("DISCONNECT: {}", e);
    }
    // Cached results of the previous test confuse the next association.
    let _ = ctrl.command(&ifname, "SET ignore_old_scan_res 1");
    let _ = ctrl.command(&ifname, "BSS_FLUSH");
    Ok(CmdResult::Success)
}

fn sta_reassoc(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let Some(bssid) = c.get("bssid") else {
        return Ok(r.error("errorCode,Missing bssid argument"));
    };
    let driver = dut.env.driver();

    if !matches!(driver, DriverType::Wcn | DriverType::Ar6003) {
        // The current network may come from sta_associate or an earlier profile.
        let ctrl = dut.ctrl();
        if ctrl
            .set_network(&ifname, dut.infra_network_id, "bssid", bssid)
            .and_then(|_| ctrl.set_network(&ifname, 0, "bssid", bssid))
            .is_err()
        {
            return Ok(CmdResult::Error);
        }
    }

    let mut mon = match dut.ctrl().monitor(&ifname) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to open wpa_supplicant monitor connection: {}", e);
            return Ok(CmdResult::Invalid);
        }
    };

    if driver == DriverType::Wcn {
        if !dut.env.run_logged(&format!("iwpriv {} reassoc", ifname)) {
            return Ok(CmdResult::Error);
        }
    } else if dut.ctrl().command(&ifname, "REASSOCIATE").is_err() {
        return Ok(r.error("errorCode,Failed to request reassociation"));
    }

    match wait_for(
        mon.as_mut(),
        &[WpaEvent::Connected],
        dut.env.cfg.event_timeout,
        &dut.env.stop,
    ) {
        Ok(_) => Ok(CmdResult::Success),
        Err(e) => {
            info!("Connection did not complete: {}", e);
            Ok(CmdResult::Invalid)
        }
    }
}

fn sta_scan(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let ifname = station(dut, c);
    let ctrl = dut.ctrl();
    if let Some(hessid) = c.get("HESSID") {
        let _ = ctrl.command(&ifname, &format!("SET hessid {}", hessid));
    }
    if let Some(ant) = c.get("ACCS_NET_TYPE") {
        let _ = ctrl.command(&ifname, &format!("SET access_network_type {}", ant));
    }
    if ctrl.command(&ifname, "SCAN").is_err() {
        return Ok(r.error("errorCode,Could not start scan"));
    }
    Ok(CmdResult::Success)
}

fn sta_reset_default(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default().to_string();
    let ifname = dut.env.sta_ifname_for(&intf);

    dut.program = Program::from_name(c.get("program").or_else(|| c.get("prog")));
    dut.device_type = match c.get("type") {
        Some(t) if t.eq_ignore_ascii_case("Testbed") => DeviceType::Testbed,
        Some(t) if t.eq_ignore_ascii_case("DUT") => DeviceType::Dut,
        _ => DeviceType::Unknown,
    };
    info!("Reset to defaults: program {:?}, device {:?}", dut.program, dut.device_type);

    if dut.env.cfg.iface_down_on_reset {
        dut.env.run_logged(&format!("ifconfig {} down", ifname));
        dut.env.run_logged(&format!("ifconfig {} up", ifname));
    }

    let ctrl = dut.env.ctrl.clone();
    if dut.program == Program::Tdls {
        let _ = ctrl.command(&intf, "SET tdls_disabled 0");
        let _ = ctrl.command(&intf, "SET tdls_testing 0");
        if dut.env.driver() == DriverType::Wcn {
            let _ = ctrl.command(&intf, "SET tdls_external_control 0");
            let _ = ctrl.command(&intf, "SET tdls_trigger_control 0");
        }
    }

    if dut.program.is_wfd() {
        miracast::reset_default(dut, c);
    }

    for cmd in ["WPS_ER_STOP", "FLUSH", "SET radio_disabled 0"] {
        let _ = ctrl.command(&intf, cmd);
    }

    if dut.tmp_mac_addr
        && let Some(script) = dut.env.cfg.set_macaddr.clone()
    {
        dut.env.run_logged(&script);
        dut.tmp_mac_addr = false;
    }

    if matches!(dut.program, Program::Hs2 | Program::Hs2R2) {
        let _ = ctrl.command(&intf, "SET interworking 1");
        let _ = ctrl.command(&intf, "SET hs20 1");
    }
    let pmf = if dut.program == Program::Hs2R2 { "SET pmf 1" } else { "SET pmf 0" };
    let _ = ctrl.command(&intf, pmf);
    let _ = ctrl.command(&intf, "SET hessid 00:00:00:00:00:00");
    let _ = ctrl.command(&intf, "SET access_network_type 15");

    ip::reset_ip(&dut.env, &ifname);
    dut.last_set_ip_config_ipv6 = false;
    dut.rsne_override = None;
    dut.sta_pmf = Pmf::Disabled;
    dut.infra_ssid.clear();

    if dut.program != Program::Vht {
        return p2p::sta_p2p_reset(dut, r, c);
    }
    Ok(CmdResult::Success)
}

fn set_powersave(dut: &Dut, r: &mut Reply<'_>, val: &str) -> Step<()> {
    let ifname = dut.env.station_ifname();
    let ctrl = dut.ctrl();
    match val.to_ascii_lowercase().as_str() {
        "0" | "off" => {
            if ctrl.command(&ifname, "P2P_SET ps 0").is_err() {
                return Err(CmdResult::Error);
            }
            // Leave the test modes.
            let _ = ctrl.command(&ifname, "P2P_SET ps 98");
            let _ = ctrl.command(&ifname, "P2P_SET ps 96");
        }
        "1" | "pspoll" | "on" => {
            let _ = ctrl.command(&ifname, "P2P_SET ps 0");
            if ctrl.command(&ifname, "P2P_SET ps 97").is_err()
                || ctrl.command(&ifname, "P2P_SET ps 99").is_err()
            {
                return Err(CmdResult::Error);
            }
        }
        "3" | "psnonpoll" => {
            let _ = ctrl.command(&ifname, "P2P_SET ps 98");
            let _ = ctrl.command(&ifname, "P2P_SET ps 96");
            if ctrl.command(&ifname, "P2P_SET ps 1").is_err() {
                return Err(CmdResult::Error);
            }
        }
        "2" | "fast" => return Err(r.error("ErrorCode,Powersave=Fast not supported")),
        _ => return Err(CmdResult::Invalid),
    }
    Ok(())
}

const STA_MODES: &[&str] = &[
    "11b", "11g", "11a", "11n", "11ng", "11nl", "11nl(nabg)", "AC", "11AC", "11ac", "11na",
    "11an",
];

fn sta_preset_testparameters(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let program = Program::from_name(c.get("Program"));

    match program {
        Program::Hs2R2 => {
            // Subscription provisioning downloads are not supported.
            if c.has("FileType") {
                return Ok(r.error("ErrorCode,Unsupported FileType"));
            }
            return Ok(CmdResult::Success);
        }
        Program::Wfd | Program::DisplayR2 => return miracast::preset_testparameters(dut, r, c),
        Program::Mbo => {
            debug!("MBO preset: {}", c.to_param_string());
            return Ok(CmdResult::Success);
        }
        _ => {}
    }

    if c.has("RTS") {
        debug!("Setting RTS not supported");
    }

    if let Some(mode) = c.get("Mode")
        && !STA_MODES.contains(&mode)
    {
        return Ok(r.error("ErrorCode,Setting Mode not supported"));
    }

    if c.has("wmm") {
        debug!("Setting wmm not supported");
    }

    if let Some(ps) = c.get("Powersave") {
        if let Err(done) = set_powersave(dut, r, ps) {
            return Ok(done);
        }
    }

    if c.has("NoAck") {
        return Ok(r.error("ErrorCode,Setting NoAck not supported"));
    }

    if c.get_int("FakePubKey").is_some_and(|v| v != 0)
        && dut.ctrl().command(intf, "SET wps_corrupt_pkhash 1").is_err()
    {
        return Ok(r.error("ErrorCode,Failed to enable FakePubKey"));
    }

    Ok(CmdResult::Success)
}

fn sta_get_parameter(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if Program::from_name(c.get("Program")).is_wfd() {
        return miracast::sta_get_parameter(dut, r, c);
    }
    Ok(r.error("ErrorCode,Unsupported parameter"))
}

pub fn sta_set_parameter(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Some(intf) = c.get("interface") else {
        return Ok(CmdResult::Invalid);
    };
    if !matches!(
        Program::from_name(c.get("program")),
        Program::Hs2 | Program::Hs2R2
    ) {
        return Ok(CmdResult::Invalid);
    }
    if !is_ifname(intf) {
        return Ok(CmdResult::Invalid);
    }
    if c.get_int("ClearARP") == Some(1)
        && !dut.env.run_logged(&format!("ip neigh flush dev {}", intf))
    {
        return Ok(r.error("errorCode,Failed to clear ARP cache"));
    }
    Ok(CmdResult::Success)
}

fn sta_set_macaddr(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let mac = c.get("MAC").unwrap_or_default();
    info!("Change local MAC address for interface {} to {}", intf, mac);
    let default = mac.eq_ignore_ascii_case("default");
    if !default && !is_mac_addr(mac) {
        return Ok(CmdResult::Invalid);
    }

    let Some(script) = dut.env.cfg.set_macaddr.clone() else {
        if default {
            return Ok(CmdResult::Success);
        }
        return Ok(r.error("errorCode,Unsupported command"));
    };
    let cmd = if default {
        script
    } else {
        format!("{} {}", script, mac)
    };
    if !dut.env.run_logged(&cmd) {
        return Ok(r.error("errorCode,Failed to set MAC address"));
    }
    dut.tmp_mac_addr = !default;
    Ok(CmdResult::Success)
}
