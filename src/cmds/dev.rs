//! Generic `dev_*` commands, routed to the program-specific handlers.
use anyhow::Result;
use tracing::debug;

use crate::cmds::{has_interface, miracast, sta};
use crate::dispatch::{CommandTable, Reply};
use crate::dut::{Dut, Program};
use crate::proto::command::{CmdResult, Command};

pub fn register(t: &mut CommandTable) {
    t.register(
        "dev_send_frame",
        Some(|c| c.has("interface") && c.has("program")),
        dev_send_frame,
    );
    t.register(
        "dev_set_parameter",
        Some(|c| c.has("interface") && c.has("program")),
        dev_set_parameter,
    );
    t.register("dev_exec_action", Some(|c| c.has("program")), dev_exec_action);
    t.register("dev_configure_ie", Some(has_interface), dev_configure_ie);
}

fn is_display_program(c: &Command) -> bool {
    Program::from_name(c.get("program")).is_wfd()
}

fn dev_send_frame(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if is_display_program(c) {
        return miracast::dev_send_frame(dut, r, c);
    }
    Ok(r.error("errorCode,Unsupported dev_send_frame"))
}

fn dev_set_parameter(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if c.is("Device", "STA") {
        debug!("Convert dev_set_parameter to sta_set_parameter");
        return sta::sta_set_parameter(dut, r, c);
    }
    Ok(CmdResult::Invalid)
}

fn dev_exec_action(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if is_display_program(c) {
        if !c.has("interface") {
            return Ok(CmdResult::Invalid);
        }
        return miracast::dev_exec_action(dut, r, c);
    }
    Ok(CmdResult::Error)
}

fn dev_configure_ie(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    let (Some(name), Some(contents)) = (c.get("IE_Name"), c.get("Contents")) else {
        return Ok(CmdResult::Invalid);
    };
    if !name.eq_ignore_ascii_case("RSNE") {
        return Ok(r.error("errorCode,Unsupported IE_Name value"));
    }
    dut.rsne_override = Some(contents.to_string());
    Ok(CmdResult::Success)
}

#[cfg(test)]
mod tests {
    use crate::cmds::testing::last;
    use crate::dut::tests::wlan0_dut;

    #[test]
    fn rsne_override_is_stored() {
        let (mut dut, _, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "dev_configure_ie,interface,wlan0,IE_Name,RSNE,Contents,30140100000fac04"),
            "status,COMPLETE"
        );
        assert_eq!(dut.rsne_override.as_deref(), Some("30140100000fac04"));
        assert_eq!(
            last(&mut dut, "dev_configure_ie,interface,wlan0,IE_Name,RSNXE,Contents,f40120"),
            "status,ERROR,errorCode,Unsupported IE_Name value"
        );
        assert_eq!(last(&mut dut, "dev_configure_ie,interface,wlan0,IE_Name,RSNE"), "status,INVALID");
    }

    #[test]
    fn frames_outside_display_programs() {
        let (mut dut, _, _) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "dev_send_frame,interface,wlan0,program,PMF,FrameName,disassoc"),
            "status,ERROR,errorCode,Unsupported dev_send_frame"
        );
        assert_eq!(last(&mut dut, "dev_exec_action,program,DPP"), "status,ERROR");
        assert_eq!(last(&mut dut, "dev_exec_action,program,WFD"), "status,INVALID");
    }

    #[test]
    fn set_parameter_forwards_to_station() {
        let (mut dut, _, host) = wlan0_dut();
        assert_eq!(
            last(&mut dut, "dev_set_parameter,interface,wlan0,program,HS2-R2,Device,STA,ClearARP,1"),
            "status,COMPLETE"
        );
        assert!(host.ran_prefix("ip neigh flush dev wlan0"));
        assert_eq!(
            last(&mut dut, "dev_set_parameter,interface,wlan0,program,HS2-R2,Device,AP"),
            "status,INVALID"
        );
    }
}
