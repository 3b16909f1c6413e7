use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};

use crate::dut::{DriverType, DutEnv};

pub fn is_ip_addr(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

pub fn is_ipv6_addr(s: &str) -> bool {
    s.parse::<Ipv6Addr>().is_ok()
}

/// Interface name safe to place on a shell command line.
pub fn is_ifname(s: &str) -> bool {
    !s.is_empty()
        && s.len() < 16
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// `xx:xx:xx:xx:xx:xx` in hex.
pub fn is_mac_addr(s: &str) -> bool {
    let mut n = 0;
    for part in s.split(':') {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return false;
        }
        n += 1;
    }
    n == 6
}

/// `/24` style prefix to a dotted netmask.
pub fn prefix_to_mask(prefix: u32) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        1..=32 => u32::MAX << (32 - prefix),
        _ => u32::MAX,
    };
    Ipv4Addr::from(bits)
}

/// Stop whichever DHCP client left a pid file for `ifname`.
pub fn kill_dhcp_client(env: &DutEnv, ifname: &str) {
    for pidfile in [
        format!("/var/run/dhclient-{}.pid", ifname),
        format!("/var/run/dhcpcd-{}.pid", ifname),
    ] {
        if env.host.file_exists(&pidfile) {
            info!("Killing DHCP client ({})", pidfile);
            env.run_logged(&format!("kill `cat {}`", pidfile));
            env.run_logged(&format!("rm -f {}", pidfile));
            env.sleep_secs(1);
            return;
        }
    }
}

pub fn start_dhcp_client(env: &DutEnv, ifname: &str) -> bool {
    info!("Starting DHCP client on {}", ifname);
    let cmd = format!("dhclient -nw -pf /var/run/dhclient-{}.pid {}", ifname, ifname);
    if env.run_logged(&cmd) {
        return true;
    }
    env.run_logged(&format!("dhcpcd -t 0 {} &", ifname))
}

pub fn clear_ip_addr(env: &DutEnv, ifname: &str) {
    env.run_logged(&format!("ip addr flush dev {}", ifname));
}

/// Whether a DHCP client process is running for `ifname`.
pub fn dhcp_client_running(env: &DutEnv, ifname: &str) -> bool {
    let ps = if env.driver() == DriverType::OpenWrt {
        "ps -w"
    } else {
        "ps ax"
    };
    let cmd = format!(
        "{} | grep dhclient | grep -v grep | grep -q {} || {} | grep udhcpc | grep -v grep | grep -q {} || {} | grep dhcpcd | grep -v grep | grep -q {}",
        ps, ifname, ps, ifname, ps, ifname
    );
    matches!(env.host.run(&cmd), Ok(0))
}

/// First IPv4 address and its netmask from `ip -4 -o addr show`.
pub fn ipv4_addr(env: &DutEnv, ifname: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let out = env
        .host
        .output(&format!("ip -4 -o addr show dev {}", ifname))
        .ok()?;
    out.lines().find_map(|l| {
        let mut it = l.split_whitespace();
        it.find(|t| *t == "inet")?;
        let (addr, prefix) = it.next()?.split_once('/')?;
        Some((addr.parse().ok()?, prefix_to_mask(prefix.parse().ok()?)))
    })
}

/// First global IPv6 address of `ifname`.
pub fn ipv6_addr(env: &DutEnv, ifname: &str) -> Option<String> {
    let out = env
        .host
        .output(&format!("ip -6 -o addr show dev {} scope global", ifname))
        .ok()?;
    out.lines().find_map(|l| {
        let mut it = l.split_whitespace();
        it.find(|t| *t == "inet6")?;
        let addr = it.next()?.split('/').next()?;
        (!addr.starts_with("fe80")).then(|| addr.to_string())
    })
}

/// First `nameserver` of resolv.conf.
pub fn primary_dns(env: &DutEnv) -> Option<String> {
    let text = env.host.read_file("/etc/resolv.conf").ok()?;
    text.lines().find_map(|l| {
        l.strip_prefix("nameserver")
            .filter(|r| r.starts_with([' ', '\t']))
            .map(|r| r.trim().to_string())
    })
}

/// `dhcp,<0|1>,ip,<a>,mask,<m>,primary-dns,<d>` for `ifname`.
pub fn ipv4_config(env: &DutEnv, ifname: &str) -> String {
    let dhcp = dhcp_client_running(env, ifname);
    let (ip, mask) = match ipv4_addr(env, ifname) {
        Some((ip, mask)) => (ip.to_string(), mask.to_string()),
        None => ("0.0.0.0".to_string(), "0.0.0.0".to_string()),
    };
    let dns = primary_dns(env).unwrap_or_else(|| "0.0.0.0".to_string());
    debug!("ip config {}: dhcp={} ip={} mask={} dns={}", ifname, dhcp, ip, mask, dns);
    format!(
        "dhcp,{},ip,{},mask,{},primary-dns,{}",
        dhcp as i32, ip, mask, dns
    )
}

/// Gateway of the default route on `ifname`; in a P2P group this is the GO.
pub fn default_gateway(env: &DutEnv, ifname: &str) -> Option<String> {
    let out = env
        .host
        .output(&format!("ip -4 route show dev {}", ifname))
        .ok()?;
    out.lines().find_map(|l| {
        let mut it = l.split_whitespace();
        (it.next()? == "default" && it.next()? == "via")
            .then(|| it.next())
            .flatten()
            .filter(|ip| is_ip_addr(ip))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::tests::wlan0_dut;

    #[test]
    fn masks() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(30), Ipv4Addr::new(255, 255, 255, 252));
    }

    #[test]
    fn names_and_macs() {
        assert!(is_ifname("wlan0"));
        assert!(is_ifname("p2p-wlan0-1"));
        assert!(!is_ifname(""));
        assert!(!is_ifname("wlan0;reboot"));
        assert!(!is_ifname("a_very_long_ifname"));
        assert!(is_mac_addr("02:00:00:aa:BB:99"));
        assert!(!is_mac_addr("02:00:00:00:00"));
        assert!(!is_mac_addr("02:00:00:00:00:9`"));
        assert!(!is_mac_addr("02:00:00:00:00:99:11"));
    }

    #[test]
    fn ipv4_config_line() {
        let (dut, _, host) = wlan0_dut();
        host.output_for(
            "ip -4 -o addr show dev wlan0",
            "3: wlan0    inet 192.168.1.5/24 brd 192.168.1.255 scope global wlan0\\       valid_lft forever\n",
        );
        host.add_file("/etc/resolv.conf", "# generated\nnameserver 8.8.8.8\nnameserver 1.1.1.1\n");
        host.exit_code("ps ax", 1);
        assert_eq!(
            ipv4_config(&dut.env, "wlan0"),
            "dhcp,0,ip,192.168.1.5,mask,255.255.255.0,primary-dns,8.8.8.8"
        );
    }

    #[test]
    fn ipv6_skips_link_local() {
        let (dut, _, host) = wlan0_dut();
        host.output_for(
            "ip -6 -o addr show dev wlan0",
            "3: wlan0    inet6 fe80::1/64 scope link\n3: wlan0    inet6 2001:db8::5/64 scope global\n",
        );
        assert_eq!(ipv6_addr(&dut.env, "wlan0").as_deref(), Some("2001:db8::5"));
    }

    #[test]
    fn gateway_from_routes() {
        let (dut, _, host) = wlan0_dut();
        host.output_for(
            "ip -4 route show dev p2p-wlan0-0",
            "192.168.43.0/24 proto kernel scope link src 192.168.43.5\ndefault via 192.168.43.1\n",
        );
        assert_eq!(default_gateway(&dut.env, "p2p-wlan0-0").as_deref(), Some("192.168.43.1"));
        assert_eq!(default_gateway(&dut.env, "wlan0"), None);
    }

    #[test]
    fn dhcp_client_kill_uses_pid_file() {
        let (dut, _, host) = wlan0_dut();
        host.add_file("/var/run/dhcpcd-wlan0.pid", "123");
        kill_dhcp_client(&dut.env, "wlan0");
        assert!(host.ran_prefix("kill `cat /var/run/dhcpcd-wlan0.pid`"));
        assert!(!host.ran_prefix("kill `cat /var/run/dhclient-wlan0.pid`"));
    }
}
