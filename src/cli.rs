use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::dut::{DEFAULT_CTRL_DIR, DEFAULT_PORT, DriverType, DutConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sigma_dut",
    about = "WFA Sigma DUT control agent (CAPI over TCP)",
    disable_version_flag = true
)]
pub struct Cli {
    /// TCP port for CAPI connections
    #[arg(short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Send one command to a running instance and print the reply
    #[arg(short = 'l', value_name = "CMD")]
    pub local_cmd: Option<String>,
    /// Main interface
    #[arg(short = 'M', value_name = "IFNAME")]
    pub main_ifname: Option<String>,
    /// Station interface
    #[arg(short = 'S', value_name = "IFNAME")]
    pub station_ifname: Option<String>,
    /// P2P management interface
    #[arg(short = 'P', value_name = "IFNAME")]
    pub p2p_ifname: Option<String>,
    /// wpa_supplicant control interface directory
    #[arg(short = 'w', value_name = "DIR", default_value = DEFAULT_CTRL_DIR)]
    pub ctrl_dir: String,
    /// Run in the background
    #[arg(short = 'B', default_value_t = false)]
    pub daemonize: bool,
    /// More verbose (repeatable)
    #[arg(short = 'd', action = ArgAction::Count)]
    pub debug: u8,
    /// Less verbose (repeatable)
    #[arg(short = 'q', action = ArgAction::Count)]
    pub quiet: u8,
    /// No timestamps in the log
    #[arg(short = 't', default_value_t = false)]
    pub no_timestamps: bool,
    /// Append CAPI commands and responses to this file
    #[arg(short = 'L', value_name = "FILE")]
    pub summary_log: Option<PathBuf>,
    /// Suffix appended to the reported version
    #[arg(short = 'v', value_name = "SUFFIX")]
    pub version_suffix: Option<String>,
    /// Print the version and exit
    #[arg(short = 'V', default_value_t = false)]
    pub print_version: bool,
    /// Wi-Fi chip type (WCN, ATHEROS, AR6003, MAC80211, QNXNTO, OPENWRT, LINUX-WCN)
    #[arg(short = 'c', value_name = "TYPE")]
    pub chip: Option<DriverType>,
    /// Take the interface down and up on reset
    #[arg(short = 'u', default_value_t = false)]
    pub iface_down_on_reset: bool,
    /// Do not configure IP addresses
    #[arg(short = 'n', default_value_t = false)]
    pub no_ip_addr_set: bool,
    /// Script that changes the local MAC address
    #[arg(short = 'm', value_name = "SCRIPT")]
    pub set_macaddr: Option<String>,
    /// Address of this device when it is a P2P GO
    #[arg(short = 'i', value_name = "IP", default_value = "192.168.43.1")]
    pub ap_inet_addr: String,
    /// Netmask of the GO address
    #[arg(short = 'k', value_name = "MASK", default_value = "255.255.255.0")]
    pub ap_inet_mask: String,
    /// Manage DHCP for P2P groups from a background monitor
    #[arg(short = 'J', default_value_t = false)]
    pub internal_dhcp: bool,
    /// Wi-Fi Display helper program
    #[arg(short = 'x', value_name = "PROGRAM")]
    pub wfd_helper: Option<String>,
    /// Directory for generated configuration files
    #[arg(long, value_name = "DIR", default_value = "/tmp")]
    pub tmpdir: String,
}

impl Cli {
    pub fn dut_config(&self) -> DutConfig {
        DutConfig {
            main_ifname: self.main_ifname.clone(),
            station_ifname: self.station_ifname.clone(),
            p2p_ifname: self.p2p_ifname.clone(),
            ctrl_dir: self.ctrl_dir.clone(),
            tmpdir: self.tmpdir.trim_end_matches('/').to_string(),
            driver: self.chip.unwrap_or_default(),
            version_suffix: self.version_suffix.clone(),
            iface_down_on_reset: self.iface_down_on_reset,
            no_ip_addr_set: self.no_ip_addr_set,
            set_macaddr: self.set_macaddr.clone(),
            ap_inet_addr: self.ap_inet_addr.clone(),
            ap_inet_mask: self.ap_inet_mask.clone(),
            internal_dhcp: self.internal_dhcp,
            ..Default::default()
        }
    }
}
