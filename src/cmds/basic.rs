use anyhow::Result;
use tracing::debug;

use crate::dispatch::{CommandTable, Reply, capi_note};
use crate::dut::{DriverType, Dut};
use crate::proto::command::{CmdResult, Command};

const VENDOR: &str = "Qualcomm Atheros";

pub fn register(t: &mut CommandTable) {
    t.register("ca_get_version", None, ca_get_version);
    t.register("device_get_info", None, device_get_info);
    t.register(
        "device_list_interfaces",
        Some(|c| c.has("interfaceType")),
        device_list_interfaces,
    );
    // Harness bookkeeping for the AP and power switch; nothing to do here.
    t.register("AccessPoint", None, positional_noop);
    t.register("PowerSwitch", None, positional_noop);
}

fn ca_get_version(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if let Some(info) = c.get("TestInfo") {
        let note = capi_note(&format!("TestInfo:{}", info));
        let _ = dut.ctrl().request(&dut.env.main_ifname(), &note);
    }
    Ok(r.complete("version,1.0"))
}

/// `" v..."` part of the first output line of a `-v` style command.
fn tool_version(dut: &Dut, cmd: &str) -> String {
    let out = dut.host().output(cmd).unwrap_or_default();
    let first = out.lines().next().unwrap_or_default();
    match first.find(" v") {
        Some(pos) => first[pos + 1..].to_string(),
        None => String::new(),
    }
}

fn tool_version_local_first(dut: &Dut, cmd: &str) -> String {
    let v = tool_version(dut, &format!("./{}", cmd));
    if v.is_empty() { tool_version(dut, cmd) } else { v }
}

fn model(dut: &Dut) -> String {
    let main = dut.env.main_ifname();
    if !dut.host().file_exists(&format!("/sys/class/net/{}/phy80211", main)) {
        return "Linux".into();
    }
    let link = dut
        .host()
        .output(&format!("readlink /sys/class/net/{}/device/driver", main))
        .unwrap_or_default();
    let link = link.trim();
    let driver = link.rsplit('/').next().unwrap_or_default();
    format!("Linux/{}", driver)
}

fn version(dut: &Dut) -> String {
    let h = dut.host();
    let compat = h
        .read_file("/sys/module/compat/parameters/backported_kernel_version")
        .or_else(|_| h.read_file("/sys/module/compat/parameters/compat_version"))
        .map(|s| s.lines().next().unwrap_or_default().to_string())
        .unwrap_or_default();
    let hapd = tool_version_local_first(dut, "hostapd -v 2>&1");
    let wpas = tool_version_local_first(dut, "wpa_supplicant -v");
    let fw = match dut.env.driver() {
        DriverType::Wcn | DriverType::LinuxWcn => tool_version(dut, "iwpriv wlan0 version"),
        _ => String::new(),
    };

    let mut v = format!("drv={}", compat);
    for (tag, val) in [("wpas", &wpas), ("hapd", &hapd), ("wlan", &fw)] {
        if !val.is_empty() {
            v.push_str(&format!("/{}={}", tag, val));
        }
    }
    v.push_str(&format!("/sigma={}", env!("CARGO_PKG_VERSION")));
    if let Some(suffix) = &dut.env.cfg.version_suffix {
        v.push('@');
        v.push_str(suffix);
    }
    v
}

fn device_get_info(dut: &mut Dut, r: &mut Reply<'_>, _c: &Command) -> Result<CmdResult> {
    let resp = format!(
        "vendor,{},model,{},version,{}",
        VENDOR,
        model(dut),
        version(dut)
    );
    Ok(r.complete(&resp))
}

fn device_list_interfaces(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let Some(kind) = c.get("interfaceType") else {
        return Ok(CmdResult::Invalid);
    };
    debug!("device_list_interfaces - interfaceType={}", kind);
    if kind != "802.11" {
        return Ok(CmdResult::Error);
    }
    match c.get("band") {
        None => {}
        Some(b) if b.eq_ignore_ascii_case("24g") => dut.use_5g = false,
        Some(b) if b.eq_ignore_ascii_case("5g") => dut.use_5g = true,
        Some(_) => {
            r.complete("errorCode,Unsupported band value");
            return Ok(CmdResult::StatusSentError);
        }
    }
    let resp = format!("interfaceType,802.11,interfaceID,{}", dut.env.main_ifname());
    Ok(r.complete(&resp))
}

fn positional_noop(_dut: &mut Dut, _r: &mut Reply<'_>, _c: &Command) -> Result<CmdResult> {
    Ok(CmdResult::Success)
}

#[cfg(test)]
mod tests {
    use crate::cmds::testing::{last, run};
    use crate::dut::tests::wlan0_dut;

    #[test]
    fn version_with_test_info_note() {
        let (mut dut, ctrl, _) = wlan0_dut();
        assert_eq!(
            run(&mut dut, "ca_get_version,TestInfo,5.2.1"),
            "status,RUNNING\r\nstatus,COMPLETE,version,1.0\r\n"
        );
        assert!(ctrl.was_sent("NOTE CAPI:TestInfo:5.2.1"));
    }

    #[test]
    fn device_info_fields() {
        let (mut dut, _, host) = wlan0_dut();
        host.add_file("/sys/class/net/wlan0/phy80211", "");
        host.output_for("readlink /sys/class/net/wlan0/device/driver", "../../../bus/pci/drivers/ath10k_pci\n");
        host.add_file("/sys/module/compat/parameters/compat_version", "backports-5.4\n");
        host.output_for("wpa_supplicant -v", "wpa_supplicant v2.10\nCopyright (c)\n");
        let line = last(&mut dut, "device_get_info");
        assert_eq!(
            line,
            format!(
                "status,COMPLETE,vendor,Qualcomm Atheros,model,Linux/ath10k_pci,version,drv=backports-5.4/wpas=v2.10/sigma={}",
                env!("CARGO_PKG_VERSION")
            )
        );
    }

    #[test]
    fn list_interfaces() {
        let (mut dut, _, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "device_list_interfaces,interfaceType,802.11,band,5G"),
            "status,COMPLETE,interfaceType,802.11,interfaceID,wlan0"
        );
        assert!(dut.use_5g);
        assert_eq!(
            last(&mut dut, "device_list_interfaces,interfaceType,802.11,band,6g"),
            "status,COMPLETE,errorCode,Unsupported band value"
        );
        assert_eq!(last(&mut dut, "device_list_interfaces,interfaceType,802.3"), "status,ERROR");
        assert_eq!(
            run(&mut dut, "device_list_interfaces,band,5g"),
            "status,INVALID,errorCode,Invalid parameters\r\n"
        );
    }

    #[test]
    fn positional_targets_accepted() {
        let (mut dut, _, _) = wlan0_dut();
        assert_eq!(last(&mut dut, "AccessPoint,AP1,Program,WFD"), "status,COMPLETE");
        assert_eq!(last(&mut dut, "PowerSwitch,PS1,state,on"), "status,COMPLETE");
    }
}
