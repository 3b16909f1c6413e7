use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dut::DutEnv;
use crate::netcfg::{self, kill_dhcp_client, start_dhcp_client};
use crate::wpa::events::{GroupRole, GroupStarted, WaitError, WpaEvent, wait_for};

fn server_pidfile(env: &DutEnv, ifname: &str) -> String {
    format!("{}/sigma_dut-dnsmasq-{}.pid", env.cfg.tmpdir, ifname)
}

pub fn lease_file(env: &DutEnv) -> String {
    format!("{}/sigma_dut-dnsmasq.leases", env.cfg.tmpdir)
}

/// First three octets of the GO address, used for the lease pool.
fn pool_base(addr: &str) -> Option<String> {
    let ip: Ipv4Addr = addr.parse().ok()?;
    let o = ip.octets();
    Some(format!("{}.{}.{}", o[0], o[1], o[2]))
}

/// Address the group interface and start DHCP on it: a server when we are
/// the GO, a client otherwise.
pub fn start_dhcp(env: &DutEnv, ifname: &str, role: GroupRole) -> bool {
    match role {
        GroupRole::Client => {
            kill_dhcp_client(env, ifname);
            start_dhcp_client(env, ifname)
        }
        GroupRole::Go => {
            let cfg = &env.cfg;
            if !env.run_logged(&format!(
                "ifconfig {} {} netmask {} up",
                ifname, cfg.ap_inet_addr, cfg.ap_inet_mask
            )) {
                return false;
            }
            let Some(base) = pool_base(&cfg.ap_inet_addr) else {
                warn!("bad GO address {}", cfg.ap_inet_addr);
                return false;
            };
            info!("Starting DHCP server on {}", ifname);
            env.run_logged(&format!(
                "dnsmasq --no-hosts --no-resolv --bind-interfaces -i {} -x {} -F {}.100,{}.200,1h --dhcp-leasefile={}",
                ifname,
                server_pidfile(env, ifname),
                base,
                base,
                lease_file(env)
            ))
        }
    }
}

pub fn stop_dhcp(env: &DutEnv, ifname: &str, role: GroupRole) {
    match role {
        GroupRole::Client => kill_dhcp_client(env, ifname),
        GroupRole::Go => {
            let pidfile = server_pidfile(env, ifname);
            if env.host.file_exists(&pidfile) {
                info!("Stopping DHCP server on {}", ifname);
                env.run_logged(&format!("kill `cat {}`", pidfile));
                env.run_logged(&format!("rm -f {}", pidfile));
            }
        }
    }
}

/// IP leased to `mac`, one lease per line: `<expiry> <mac> <ip> <host> <id>`.
pub fn lease_ip(leases: &str, mac: &str) -> Option<String> {
    leases.lines().find_map(|l| {
        let mut it = l.split_whitespace();
        let _expiry = it.next()?;
        let lmac = it.next()?;
        let ip = it.next()?;
        let same = match (lmac.get(..17), mac.get(..17)) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        same.then(|| ip.to_string())
    })
}

/// Peer address as seen by a GO: poll the lease file once a second.
pub fn go_peer_ip(env: &DutEnv, macs: &[&str], wait_secs: u32) -> Option<String> {
    let path = lease_file(env);
    for _ in 0..wait_secs.max(1) {
        if env.stop.load(Ordering::Relaxed) {
            return None;
        }
        if let Ok(text) = env.host.read_file(&path)
            && let Some(ip) = macs.iter().find_map(|m| lease_ip(&text, m))
        {
            info!("Peer IP address {} from DHCP leases", ip);
            return Some(ip);
        }
        env.sleep_secs(1);
    }
    info!("No lease found for {:?}", macs);
    None
}

/// Peer address as seen by a client: the gateway handed out by the GO.
pub fn client_peer_ip(env: &DutEnv, ifname: &str, wait_secs: u32) -> Option<String> {
    for _ in 0..wait_secs.max(1) {
        if env.stop.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(ip) = netcfg::default_gateway(env, ifname) {
            info!("GO IP address {}", ip);
            return Some(ip);
        }
        env.sleep_secs(1);
    }
    None
}

/// Interface and role named by `P2P-GROUP-REMOVED <ifname> <GO|client> ...`.
fn group_removed(body: &str) -> Option<(String, GroupRole)> {
    let mut it = body
        .strip_prefix(WpaEvent::GroupRemoved.prefix())?
        .split_whitespace();
    let ifname = it.next()?.to_string();
    let role = match it.next()? {
        "GO" => GroupRole::Go,
        _ => GroupRole::Client,
    };
    Some((ifname, role))
}

/// Start or stop DHCP as P2P groups come and go (`-J`). Runs until the
/// shared stop flag is raised.
pub fn spawn_monitor(env: DutEnv) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let ifname = env.p2p_ifname().to_string();
        let wanted = [WpaEvent::GroupStarted, WpaEvent::GroupRemoved];
        while !env.stop.load(Ordering::Relaxed) {
            let mut mon = match env.ctrl.monitor(&ifname) {
                Ok(m) => m,
                Err(e) => {
                    debug!("dhcp monitor: {}", e);
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            info!("DHCP monitor attached to {}", ifname);
            loop {
                match wait_for(mon.as_mut(), &wanted, Duration::from_secs(60), &env.stop) {
                    Ok((WpaEvent::GroupStarted, body)) => {
                        if let Some(g) = GroupStarted::parse(&body) {
                            start_dhcp(&env, &g.ifname, g.role);
                        }
                    }
                    Ok((_, body)) => {
                        if let Some((group, role)) = group_removed(&body) {
                            stop_dhcp(&env, &group, role);
                        }
                    }
                    Err(WaitError::Timeout) => {}
                    Err(WaitError::Cancelled) => return,
                    Err(WaitError::Ctrl(e)) => {
                        warn!("DHCP monitor lost {}: {}", ifname, e);
                        thread::sleep(Duration::from_secs(1));
                        break;
                    }
                }
            }
        }
    })
}
