//! Hotspot 2.0 R2 server-side commands. The DUT only acknowledges them.
use anyhow::Result;
use tracing::debug;

use crate::dispatch::{CommandTable, Reply};
use crate::dut::{Dut, Program};
use crate::proto::command::{CmdResult, Command};

pub fn register(t: &mut CommandTable) {
    t.register("server_reset_default", None, server_reset_default);
    t.register("server_request_status", None, server_request_status);
}

fn is_hs2_r2(c: &Command) -> bool {
    Program::from_name(c.get("Program")) == Program::Hs2R2
}

fn server_reset_default(_dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if !is_hs2_r2(c) {
        return Ok(r.error("errorCode,Unsupported program"));
    }
    if let Some(user) = c.get("UserName") {
        debug!("Reset user {}", user);
    }
    if let Some(serial) = c.get("SerialNo") {
        debug!("Reset serial number {}", serial);
    }
    Ok(CmdResult::Success)
}

fn server_request_status(dut: &mut Dut, r: &mut Reply<'_>, c: &Command) -> Result<CmdResult> {
    if !is_hs2_r2(c) {
        return Ok(r.error("errorCode,Unsupported program"));
    }
    let osu = match c.get("Device") {
        Some(d) if d.eq_ignore_ascii_case("OSUServer") => true,
        Some(d) if d.eq_ignore_ascii_case("AAAServer") => false,
        _ => return Ok(r.error("errorCode,Unsupported device type")),
    };
    let Some(timeout) = c.get("Timeout") else {
        return Ok(r.error("errorCode,Missing timeout"));
    };
    debug!("timeout: {}", timeout);
    for key in ["UserName", "SerialNo", "imsi_val", "ClientMACAddr", "Status"] {
        if let Some(v) = c.get(key) {
            debug!("{}: {}", key, v);
        }
    }

    if osu && c.is("Status", "Remediation") {
        dut.env.sleep_secs(1);
        return Ok(r.complete("RemediationStatus,Remediation Complete"));
    }
    Ok(CmdResult::Success)
}
