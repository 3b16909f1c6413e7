//! Station IP configuration and reachability.
use anyhow::Result;
use tracing::{debug, info};

use crate::cmds::has_interface;
use crate::dispatch::{CommandTable, Reply};
use crate::dut::{Dut, DutEnv};
use crate::netcfg::{
    self, clear_ip_addr, is_ifname, is_ip_addr, is_ipv6_addr, kill_dhcp_client,
    start_dhcp_client,
};
use crate::proto::command::{CmdResult, Command};

const DEFAULT_PING_TIMEOUT: i64 = 90;

pub fn register(t: &mut CommandTable) {
    t.register("sta_get_ip_config", Some(has_interface), sta_get_ip_config);
    t.register("sta_set_ip_config", Some(has_interface), sta_set_ip_config);
    t.register(
        "sta_verify_ip_connection",
        Some(|c| c.has("interface") && c.has("destination")),
        sta_verify_ip_connection,
    );
}

fn static_ip_path(env: &DutEnv) -> String {
    format!("{}/sigma_dut-static-ip", env.cfg.tmpdir)
}

/// Record the static address so external scripts can restore it after a
/// reconnect: `<4|6> <addr> <mask> <gw|N/A>`.
fn write_static_ip(env: &DutEnv, proto: u8, addr: &str, mask: &str, gw: Option<&str>) {
    let line = format!("{} {} {} {}\n", proto, addr, mask, gw.unwrap_or("N/A"));
    let path = static_ip_path(env);
    if let Err(e) = env.host.write_file(&path, &line) {
        info!("Could not write {}: {}", path, e);
    }
}

pub fn remove_static_ip(env: &DutEnv) {
    let path = static_ip_path(env);
    if env.host.file_exists(&path) {
        env.run_logged(&format!("rm -f {}", path));
    }
}

fn sta_get_ip_config(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let ifname = dut.env.sta_ifname_for(intf);

    // Reported even without a lease; the harness retries.
    dut.env.wait_ip_addr(&ifname, 15);

    let kind = c.get_int("Type").unwrap_or(1);
    if kind == 2 || dut.last_set_ip_config_ipv6 {
        for _ in 0..10 {
            if let Some(addr) = netcfg::ipv6_addr(&dut.env, &ifname) {
                return Ok(r.complete(&format!("ip,{}", addr)));
            }
            dut.env.sleep_secs(1);
        }
        debug!("No global IPv6 address on {}", ifname);
        if kind == 2 {
            return Ok(CmdResult::Error);
        }
    }

    match kind {
        1 => {
            let resp = netcfg::ipv4_config(&dut.env, &ifname);
            Ok(r.complete(&resp))
        }
        2 => Ok(CmdResult::Error),
        _ => Ok(r.error("errorCode,Unsupported address type")),
    }
}

fn set_ipv6(dut: &mut Dut, r: &mut Reply<'_>, ifname: &str, ip: &str, mask: &str) -> CmdResult {
    if !is_ipv6_addr(ip) {
        return CmdResult::Invalid;
    }
    let Some(prefix) = mask.parse::<u8>().ok().filter(|p| *p <= 128) else {
        return CmdResult::Invalid;
    };
    let env = &dut.env;
    if env.cfg.no_ip_addr_set {
        env.run_logged(&format!("sysctl net.ipv6.conf.{}.disable_ipv6=1", ifname));
    } else {
        env.run_logged(&format!("ip -6 addr del {}/{} dev {}", ip, prefix, ifname));
        if !env.run_logged(&format!("ip -6 addr add {}/{} dev {}", ip, prefix, ifname)) {
            return r.error("ErrorCode,Failed to set IPv6 address");
        }
    }
    write_static_ip(env, 6, ip, &prefix.to_string(), None);
    dut.last_set_ip_config_ipv6 = true;
    CmdResult::Success
}

fn set_ipv4(dut: &Dut, r: &mut Reply<'_>, ifname: &str, c: &Command) -> CmdResult {
    let env = &dut.env;
    let ip = c.get("ip").unwrap_or_default();
    let mask = c.get("mask").unwrap_or_default();
    if !is_ip_addr(ip) || !is_ip_addr(mask) {
        return CmdResult::Invalid;
    }

    kill_dhcp_client(env, ifname);
    if !env.cfg.no_ip_addr_set
        && !env.run_logged(&format!("ifconfig {} {} netmask {}", ifname, ip, mask))
    {
        return r.error("ErrorCode,Failed to set IP address");
    }

    let gw = c.get("defaultGateway");
    if let Some(gw) = gw {
        if !is_ip_addr(gw) {
            return CmdResult::Invalid;
        }
        if !env.run_logged(&format!("route add default gw {}", gw))
            && !env.run_logged(&format!("ip ro re default via {}", gw))
        {
            return r.error("ErrorCode,Failed to set default gateway");
        }
    }

    for key in ["primary-dns", "secondary-dns"] {
        if let Some(dns) = c.get(key) {
            debug!("Ignoring {} {}", key, dns);
        }
    }

    write_static_ip(env, 4, ip, mask, gw);
    CmdResult::Success
}

fn sta_set_ip_config(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let intf = c.get("interface").unwrap_or_default();
    let ifname = dut.env.sta_ifname_for(intf);
    if !is_ifname(&ifname) {
        return Ok(CmdResult::Invalid);
    }
    if !dut.host().iface_exists(&ifname) {
        return Ok(r.error("ErrorCode,Unknown interface"));
    }

    let kind = c.get_int("Type").unwrap_or(1);
    if kind != 1 && kind != 2 {
        return Ok(r.error("ErrorCode,Unsupported address type"));
    }
    dut.last_set_ip_config_ipv6 = false;

    if c.get_bool("dhcp") == Some(true) {
        remove_static_ip(&dut.env);
        if kind == 2 {
            // SLAAC takes care of IPv6.
            dut.last_set_ip_config_ipv6 = true;
            return Ok(CmdResult::Success);
        }
        kill_dhcp_client(&dut.env, &ifname);
        if !start_dhcp_client(&dut.env, &ifname) {
            return Ok(CmdResult::Error);
        }
        return Ok(CmdResult::Success);
    }

    let Some(ip) = c.get("ip") else {
        return Ok(r.invalid("ErrorCode,Missing IP address"));
    };
    let Some(mask) = c.get("mask") else {
        return Ok(r.invalid("ErrorCode,Missing subnet mask"));
    };

    if kind == 2 {
        return Ok(set_ipv6(dut, r, &ifname, ip, mask));
    }
    Ok(set_ipv4(dut, r, &ifname, c))
}

fn sta_verify_ip_connection(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let dst = c.get("destination").unwrap_or_default();
    if !is_ip_addr(dst) {
        return Ok(CmdResult::Invalid);
    }
    let timeout = c
        .get_int("timeout")
        .unwrap_or(DEFAULT_PING_TIMEOUT)
        .max(1);
    let cmd = format!("ping {} -c 3 -W {}", dst, timeout);
    debug!("Run: {}", cmd);
    match dut.host().run(&cmd) {
        Ok(0) => Ok(r.complete("connected,1")),
        Ok(1) => Ok(r.complete("connected,0")),
        Ok(code) => {
            info!("ping exited with {}", code);
            Ok(CmdResult::Error)
        }
        Err(e) => {
            info!("ping: {}", e);
            Ok(CmdResult::Error)
        }
    }
}

/// Forget any static configuration and DHCP state on `ifname`.
pub fn reset_ip(env: &DutEnv, ifname: &str) {
    remove_static_ip(env);
    kill_dhcp_client(env, ifname);
    clear_ip_addr(env, ifname);
}
