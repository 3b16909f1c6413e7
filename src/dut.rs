use anyhow::{Context, Result, bail};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, info};

use crate::host::Host;
use crate::wfd::WfdExtension;
use crate::wpa::events::{DEFAULT_EVENT_TIMEOUT, GroupRole};
use crate::wpa::{CtrlExt, CtrlIface};

pub const DEFAULT_CTRL_DIR: &str = "/var/run/wpa_supplicant/";
pub const DEFAULT_PORT: u16 = 9000;
/// Control port announced in our own WFD IE.
pub const WFD_DEFAULT_SESSION_PORT: u16 = 7236;

/// Wi-Fi chip family, from `-c` or guessed from sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverType {
    #[default]
    NotSet,
    Wcn,
    Atheros,
    Ar6003,
    Mac80211,
    Qnxnto,
    OpenWrt,
    LinuxWcn,
}

impl FromStr for DriverType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The vendor families accept suffixed names (e.g. WCN3990).
        if s.starts_with("WCN") {
            Ok(DriverType::Wcn)
        } else if s.starts_with("ATHEROS") {
            Ok(DriverType::Atheros)
        } else if s.starts_with("AR6003") {
            Ok(DriverType::Ar6003)
        } else if s == "MAC80211" {
            Ok(DriverType::Mac80211)
        } else if s == "QNXNTO" {
            Ok(DriverType::Qnxnto)
        } else if s == "OPENWRT" {
            Ok(DriverType::OpenWrt)
        } else if s.starts_with("LINUX-WCN") {
            Ok(DriverType::LinuxWcn)
        } else {
            Err(format!("unknown chip type '{}'", s))
        }
    }
}

/// Certification program named by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Program {
    #[default]
    Unknown,
    Tdls,
    Hs2,
    Hs2R2,
    Wfd,
    DisplayR2,
    Pmf,
    Wps,
    Ht,
    Vht,
    Ghz60,
    Nan,
    Loc,
    Mbo,
}

impl Program {
    pub fn from_name(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return Program::Unknown;
        };
        match name.to_ascii_lowercase().as_str() {
            "tdls" => Program::Tdls,
            "hs2" => Program::Hs2,
            "hs2_r2" | "hs2-r2" => Program::Hs2R2,
            "wfd" => Program::Wfd,
            "displayr2" => Program::DisplayR2,
            "pmf" => Program::Pmf,
            "wps" => Program::Wps,
            "11n" => Program::Ht,
            "vht" => Program::Vht,
            "60ghz" => Program::Ghz60,
            "nan" => Program::Nan,
            "loc" => Program::Loc,
            "mbo" => Program::Mbo,
            _ => Program::Unknown,
        }
    }

    pub fn is_wfd(self) -> bool {
        matches!(self, Program::Wfd | Program::DisplayR2)
    }
}

/// Whether the station is the DUT or a testbed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Testbed,
    Dut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WpsMethod {
    #[default]
    NotReady,
    Pbc,
    PinDisplay,
    PinLabel,
    PinKeypad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pmf {
    #[default]
    Disabled,
    Optional,
    Required,
}

/// Wi-Fi Display role of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WfdDeviceType {
    #[default]
    Source,
    PrimarySink,
    SecondarySink,
}

impl WfdDeviceType {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Some(WfdDeviceType::Source),
            "psink" | "primarysink" => Some(WfdDeviceType::PrimarySink),
            "ssink" | "secondarysink" => Some(WfdDeviceType::SecondarySink),
            _ => None,
        }
    }

    /// Numeric type carried in the WFD IE.
    pub fn code(self) -> i32 {
        match self {
            WfdDeviceType::Source => 0,
            WfdDeviceType::PrimarySink => 1,
            WfdDeviceType::SecondarySink => 2,
        }
    }

    /// Session role handed to the display extension (source starts as 1).
    pub fn session_role(self) -> i32 {
        1 - self.code()
    }

    pub fn is_sink(self) -> bool {
        self != WfdDeviceType::Source
    }
}

/// One P2P group this device is part of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pGroup {
    pub ifname: String,
    pub grpid: String,
    pub ssid: String,
    pub role: GroupRole,
    pub passphrase: Option<String>,
}

/// Startup configuration, read-only afterwards.
#[derive(Debug, Clone)]
pub struct DutConfig {
    pub main_ifname: Option<String>,
    pub station_ifname: Option<String>,
    pub p2p_ifname: Option<String>,
    pub ctrl_dir: String,
    pub tmpdir: String,
    pub driver: DriverType,
    pub version_suffix: Option<String>,
    pub iface_down_on_reset: bool,
    pub no_ip_addr_set: bool,
    pub set_macaddr: Option<String>,
    pub ap_inet_addr: String,
    pub ap_inet_mask: String,
    pub internal_dhcp: bool,
    pub event_timeout: Duration,
}

impl Default for DutConfig {
    fn default() -> Self {
        Self {
            main_ifname: None,
            station_ifname: None,
            p2p_ifname: None,
            ctrl_dir: DEFAULT_CTRL_DIR.to_string(),
            tmpdir: "/tmp".to_string(),
            driver: DriverType::NotSet,
            version_suffix: None,
            iface_down_on_reset: false,
            no_ip_addr_set: false,
            set_macaddr: None,
            ap_inet_addr: "192.168.43.1".to_string(),
            ap_inet_mask: "255.255.255.0".to_string(),
            internal_dhcp: false,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }
}

/// The shareable half of the DUT: collaborators plus configuration.
/// Background workers get their own clone.
#[derive(Clone)]
pub struct DutEnv {
    pub cfg: Arc<DutConfig>,
    pub ctrl: Arc<dyn CtrlIface>,
    pub host: Arc<dyn Host>,
    pub wfd: Arc<dyn WfdExtension>,
    pub stop: Arc<AtomicBool>,
    p2p_ifname: String,
}

impl DutEnv {
    pub fn new(
        cfg: DutConfig,
        ctrl: Arc<dyn CtrlIface>,
        host: Arc<dyn Host>,
        wfd: Arc<dyn WfdExtension>,
    ) -> Self {
        let mut env = Self {
            cfg: Arc::new(cfg),
            ctrl,
            host,
            wfd,
            stop: Arc::new(AtomicBool::new(false)),
            p2p_ifname: String::new(),
        };
        env.p2p_ifname = env.determine_p2p_ifname();
        env
    }

    pub fn driver(&self) -> DriverType {
        if self.cfg.driver != DriverType::NotSet {
            return self.cfg.driver;
        }
        if self.host.file_exists("/sys/module/mac80211") {
            DriverType::Mac80211
        } else {
            DriverType::Atheros
        }
    }

    pub fn main_ifname(&self) -> String {
        if let Some(name) = &self.cfg.main_ifname {
            return name.clone();
        }
        let h = &self.host;
        if self.driver() == DriverType::Atheros {
            return ["ath2", "ath1"]
                .into_iter()
                .find(|i| h.iface_exists(i))
                .unwrap_or("ath0")
                .to_string();
        }
        if h.iface_exists("p2p0") {
            return "p2p0".into();
        }
        if h.iface_exists("wlan1") {
            // Dual-radio device: keep STA/P2P on the first radio.
            if h.file_exists("/sys/module/mac80211") && h.iface_exists("wlan0") {
                return "wlan0".into();
            }
            return "wlan1".into();
        }
        if h.iface_exists("wlan0") {
            return "wlan0".into();
        }
        "unknown".into()
    }

    pub fn station_ifname(&self) -> String {
        if let Some(name) = &self.cfg.station_ifname {
            return name.clone();
        }
        let h = &self.host;
        if h.iface_exists("wlan1") && h.iface_exists("wlan0") {
            return "wlan0".into();
        }
        if h.iface_exists("ath0") {
            return "ath0".into();
        }
        "wlan0".into()
    }

    /// Interface used for P2P management operations.
    pub fn p2p_ifname(&self) -> &str {
        &self.p2p_ifname
    }

    /// P2P interface to use when the harness names `primary`.
    pub fn p2p_ifname_for(&self, primary: &str) -> String {
        let sta = self.station_ifname();
        if sta != primary {
            return primary.to_string();
        }
        self.p2p_ifname.clone()
    }

    /// Station interface when the harness names the main interface.
    pub fn sta_ifname_for(&self, intf: &str) -> String {
        if intf == self.main_ifname() {
            self.station_ifname()
        } else {
            intf.to_string()
        }
    }

    fn determine_p2p_ifname(&self) -> String {
        if let Some(name) = &self.cfg.p2p_ifname {
            return name.clone();
        }
        let sta = self.station_ifname();
        let dev = format!("p2p-dev-{}", sta);
        match self.ctrl.monitor(&dev) {
            Ok(_) => {
                info!("Using interface {} for P2P operations instead of interface {}", dev, sta);
                dev
            }
            Err(_) => sta,
        }
    }

    /// Poll `STATUS` for an IP address once per second.
    pub fn wait_ip_addr(&self, ifname: &str, timeout_secs: u32) -> bool {
        for remaining in (1..=timeout_secs).rev() {
            debug!("wait_ip_addr: ifname='{}' - {} seconds remaining", ifname, remaining);
            if let Ok(Some(ip)) = self.ctrl.status_field(ifname, "ip_address")
                && !ip.is_empty()
            {
                info!("IP address found: '{}'", ip);
                return true;
            }
            self.host.sleep(Duration::from_secs(1));
        }
        info!("wait_ip_addr: Could not get IP address for ifname='{}'", ifname);
        false
    }

    /// Run a shell command, logging (not failing on) a non-zero exit.
    pub fn run_logged(&self, cmd: &str) -> bool {
        match self.host.run(cmd) {
            Ok(0) => true,
            Ok(code) => {
                info!("'{}' exited with {}", cmd, code);
                false
            }
            Err(e) => {
                info!("Failed to run '{}': {}", cmd, e);
                false
            }
        }
    }

    pub fn sleep_secs(&self, secs: u64) {
        self.host.sleep(Duration::from_secs(secs));
    }
}

/// Everything the command handlers operate on.
pub struct Dut {
    pub env: DutEnv,
    pub sta_started: bool,
    pub use_5g: bool,
    pub program: Program,
    pub device_type: DeviceType,
    pub infra_ssid: String,
    pub infra_network_id: u32,
    pub wps_method: WpsMethod,
    pub wps_pin: String,
    pub persistent: bool,
    pub sta_pmf: Pmf,
    pub rsne_override: Option<String>,
    pub last_set_ip_config_ipv6: bool,
    pub tmp_mac_addr: bool,
    pub listen_chn: u32,
    pub groups: Vec<P2pGroup>,
    pub wfd_device_type: WfdDeviceType,
    pub wfd_session_port: u16,
    pub peer_mac_address: String,
    pub mdns_instance_name: String,
}

impl Dut {
    pub fn new(env: DutEnv) -> Self {
        Self {
            env,
            sta_started: false,
            use_5g: false,
            program: Program::Unknown,
            device_type: DeviceType::Unknown,
            infra_ssid: String::new(),
            infra_network_id: 0,
            wps_method: WpsMethod::NotReady,
            wps_pin: String::new(),
            persistent: false,
            sta_pmf: Pmf::Disabled,
            rsne_override: None,
            last_set_ip_config_ipv6: false,
            tmp_mac_addr: false,
            listen_chn: 6,
            groups: Vec::new(),
            wfd_device_type: WfdDeviceType::Source,
            wfd_session_port: WFD_DEFAULT_SESSION_PORT,
            peer_mac_address: String::new(),
            mdns_instance_name: String::new(),
        }
    }

    pub fn ctrl(&self) -> &dyn CtrlIface {
        self.env.ctrl.as_ref()
    }

    pub fn host(&self) -> &dyn Host {
        self.env.host.as_ref()
    }

    /// Make sure a supplicant is answering on the main interface, starting
    /// one with a minimal configuration if needed.
    pub fn start_sta_mode(&mut self) -> Result<()> {
        if self.sta_started {
            return Ok(());
        }
        let ifname = self.env.main_ifname();
        if self.ctrl().command(&ifname, "PING").is_ok() {
            self.sta_started = true;
            return Ok(());
        }

        let conf_path = format!("{}/sigma_dut-sta.conf", self.env.cfg.tmpdir);
        let ctrl_dir = self.env.cfg.ctrl_dir.trim_end_matches('/');
        let conf = format!(
            "ctrl_interface={}\ndevice_name=Test client\ndevice_type=1-0050F204-1\n",
            ctrl_dir
        );
        self.host()
            .write_file(&conf_path, &conf)
            .with_context(|| format!("writing {}", conf_path))?;

        let prefix = if self.host().file_exists("wpa_supplicant") {
            "./"
        } else {
            ""
        };
        let cmd = format!("{}wpa_supplicant -Dnl80211 -i{} -B -c {}", prefix, ifname, conf_path);
        if !self.env.run_logged(&cmd) {
            bail!("failed to start wpa_supplicant");
        }
        self.env.sleep_secs(1);
        self.ctrl()
            .command(&ifname, "PING")
            .context("Failed to communicate with wpa_supplicant")?;
        self.sta_started = true;
        Ok(())
    }

    pub fn find_group(&self, grpid: &str) -> Option<&P2pGroup> {
        self.groups.iter().find(|g| g.grpid == grpid)
    }

    pub fn add_group(&mut self, group: P2pGroup) {
        self.groups.retain(|g| g.grpid != group.grpid);
        self.groups.push(group);
    }

    pub fn remove_group(&mut self, grpid: &str) -> Option<P2pGroup> {
        let idx = self.groups.iter().position(|g| g.grpid == grpid)?;
        Some(self.groups.remove(idx))
    }
}

/// Channel number to centre frequency in MHz.
pub fn channel_to_freq(chan: u32) -> Option<u32> {
    match chan {
        1..=13 => Some(2407 + chan * 5),
        14 => Some(2484),
        15..=196 => Some(5000 + chan * 5),
        _ => None,
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::testutil::{FakeCtrl, FakeHost};
    use crate::wfd::NoWfd;

    pub fn fake_dut(cfg: DutConfig) -> (Dut, FakeCtrl, FakeHost) {
        let ctrl = FakeCtrl::new();
        let host = FakeHost::new();
        let env = DutEnv::new(cfg, Arc::new(ctrl.clone()), Arc::new(host.clone()), Arc::new(NoWfd));
        (Dut::new(env), ctrl, host)
    }

    pub fn wlan0_dut() -> (Dut, FakeCtrl, FakeHost) {
        fake_dut(DutConfig {
            main_ifname: Some("wlan0".into()),
            station_ifname: Some("wlan0".into()),
            p2p_ifname: Some("wlan0".into()),
            ..Default::default()
        })
    }

    #[test]
    fn chip_type_names() {
        assert_eq!("WCN3990".parse::<DriverType>(), Ok(DriverType::Wcn));
        assert_eq!("MAC80211".parse::<DriverType>(), Ok(DriverType::Mac80211));
        assert_eq!("LINUX-WCN".parse::<DriverType>(), Ok(DriverType::LinuxWcn));
        assert!("MAC80211X".parse::<DriverType>().is_err());
    }

    #[test]
    fn program_names() {
        assert_eq!(Program::from_name(Some("HS2-R2")), Program::Hs2R2);
        assert_eq!(Program::from_name(Some("hs2_r2")), Program::Hs2R2);
        assert_eq!(Program::from_name(Some("11n")), Program::Ht);
        assert_eq!(Program::from_name(Some("wfd")), Program::Wfd);
        assert_eq!(Program::from_name(None), Program::Unknown);
        assert!(Program::DisplayR2.is_wfd());
    }

    #[test]
    fn ifname_resolution() {
        let (dut, _, host) = fake_dut(DutConfig::default());
        // Nothing present, no mac80211: Atheros naming.
        assert_eq!(dut.env.main_ifname(), "ath0");
        assert_eq!(dut.env.station_ifname(), "wlan0");

        host.add_file("/sys/module/mac80211", "");
        assert_eq!(dut.env.main_ifname(), "unknown");
        host.add_iface("wlan1");
        assert_eq!(dut.env.main_ifname(), "wlan1");
        host.add_iface("wlan0");
        assert_eq!(dut.env.main_ifname(), "wlan0");
        assert_eq!(dut.env.station_ifname(), "wlan0");
        host.add_iface("p2p0");
        assert_eq!(dut.env.main_ifname(), "p2p0");
        assert_eq!(dut.env.sta_ifname_for("p2p0"), "wlan0");
        assert_eq!(dut.env.sta_ifname_for("wlan5"), "wlan5");
    }

    #[test]
    fn p2p_dev_interface_detected() {
        // The fake accepts monitors everywhere, so the dedicated P2P device wins.
        let (dut, _, _) = fake_dut(DutConfig {
            station_ifname: Some("wlan0".into()),
            ..Default::default()
        });
        assert_eq!(dut.env.p2p_ifname(), "p2p-dev-wlan0");
        assert_eq!(dut.env.p2p_ifname_for("wlan0"), "p2p-dev-wlan0");
        assert_eq!(dut.env.p2p_ifname_for("p2p-wlan0-1"), "p2p-wlan0-1");
    }

    #[test]
    fn start_sta_mode_launches_supplicant() {
        let (mut dut, ctrl, host) = wlan0_dut();
        ctrl.reply_once("PING", "FAIL\n");
        dut.start_sta_mode().unwrap();
        assert!(dut.sta_started);
        let conf = host.file("/tmp/sigma_dut-sta.conf").unwrap();
        assert!(conf.starts_with("ctrl_interface=/var/run/wpa_supplicant\n"));
        assert!(conf.contains("device_type=1-0050F204-1"));
        assert!(host.ran_prefix("wpa_supplicant -Dnl80211 -iwlan0 -B -c /tmp/sigma_dut-sta.conf"));
    }

    #[test]
    fn frequencies() {
        assert_eq!(channel_to_freq(1), Some(2412));
        assert_eq!(channel_to_freq(14), Some(2484));
        assert_eq!(channel_to_freq(36), Some(5180));
        assert_eq!(channel_to_freq(0), None);
    }

    #[test]
    fn wait_ip_addr_polls_status() {
        let (dut, ctrl, _) = wlan0_dut();
        ctrl.reply_once("STATUS", "wpa_state=COMPLETED\n");
        ctrl.reply_once("STATUS", "wpa_state=COMPLETED\nip_address=10.0.0.2\n");
        assert!(dut.env.wait_ip_addr("wlan0", 5));
        assert!(!dut.env.wait_ip_addr("wlan0", 2));
    }
}
