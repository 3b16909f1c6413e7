// src/proto/parser.rs
use thiserror::Error;

use super::command::{Command, Status};

/// Longest command line accepted from the harness.
pub const MAX_CMD_LEN: usize = 4096;
/// Most name/value pairs one command may carry.
pub const MAX_PARAMS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing value for parameter: {0}")]
    MissingValue(String),
    #[error("missing positional target for {0}")]
    MissingTarget(String),
    #[error("too many parameters")]
    TooManyParams,
}

/// Commands whose first field is a positional target instead of a name.
const POSITIONAL: [&str; 2] = ["AccessPoint", "PowerSwitch"];

/// Strip leading CR/LF/TAB/space and trailing spaces.
pub fn trim_line(line: &str) -> &str {
    line.trim_start_matches(['\r', '\n', '\t', ' '])
        .trim_end_matches(' ')
}

/// Public API: parse one already-trimmed CAPI line.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let Some((name, rest)) = line.split_once(',') else {
        return Ok(Command::new(line));
    };
    let mut cmd = Command::new(name);
    let mut rest = Some(rest);

    if POSITIONAL.iter().any(|p| p.eq_ignore_ascii_case(name)) {
        let r = rest.unwrap_or_default();
        let (target, tail) = r
            .split_once(',')
            .ok_or_else(|| ParseError::MissingTarget(name.to_string()))?;
        cmd.params.push((target.to_string(), String::new()));
        rest = Some(tail);
    }

    while let Some(r) = rest {
        let (k, tail) = r
            .split_once(',')
            .ok_or_else(|| ParseError::MissingValue(r.to_string()))?;
        if cmd.params.len() == MAX_PARAMS {
            return Err(ParseError::TooManyParams);
        }
        let (v, next) = match tail.split_once(',') {
            Some((v, next)) => (v, Some(next)),
            None => (tail, None),
        };
        cmd.params.push((k.to_string(), v.to_string()));
        rest = next;
    }

    Ok(cmd)
}

/// Public API: serialize a response to a CRLF-terminated line.
pub fn format_response(status: Status, payload: Option<&str>) -> String {
    match payload {
        Some(p) => format!("status,{},{}\r\n", status, p),
        None => format!("status,{}\r\n", status),
    }
}

/// Parse a response line back into status and payload (local client side).
pub fn parse_response(line: &str) -> Option<(Status, Option<&str>)> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix("status,")?;
    let (word, payload) = match rest.split_once(',') {
        Some((w, p)) => (w, Some(p)),
        None => (rest, None),
    };
    let status = match word {
        "RUNNING" => Status::Running,
        "INVALID" => Status::Invalid,
        "ERROR" => Status::Error,
        "COMPLETE" => Status::Complete,
        _ => return None,
    };
    Some((status, payload))
}

/* ---------- tests ---------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_and_pairs() {
        let cmd = parse_command("sta_get_bssid,interface,wlan0").unwrap();
        assert_eq!(cmd.name, "sta_get_bssid");
        assert_eq!(cmd.params, vec![("interface".into(), "wlan0".into())]);
        assert_eq!(cmd.get("INTERFACE"), Some("wlan0"));
    }

    #[test]
    fn parse_bare_name() {
        let cmd = parse_command("ca_get_version").unwrap();
        assert_eq!(cmd.name, "ca_get_version");
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(matches!(
            parse_command("sta_get_bssid,interface"),
            Err(ParseError::MissingValue(_))
        ));
        assert!(matches!(
            parse_command("sta_get_bssid,interface,wlan0,"),
            Err(ParseError::MissingValue(_))
        ));
    }

    #[test]
    fn empty_value_is_kept() {
        let cmd = parse_command("sta_set_ip_config,interface,,dhcp,1").unwrap();
        assert_eq!(cmd.get("interface"), Some(""));
        assert_eq!(cmd.get("dhcp"), Some("1"));
    }

    #[test]
    fn positional_target() {
        let cmd = parse_command("AccessPoint,AP1,Mode,11ng").unwrap();
        assert_eq!(cmd.params[0], ("AP1".into(), String::new()));
        assert_eq!(cmd.get("Mode"), Some("11ng"));

        let cmd = parse_command("powerswitch,PS1,cmd,on").unwrap();
        assert_eq!(cmd.params[0].0, "PS1");

        assert!(matches!(
            parse_command("AccessPoint,AP1"),
            Err(ParseError::MissingTarget(_))
        ));
    }

    #[test]
    fn param_limit() {
        let mut line = String::from("cmd");
        for i in 0..MAX_PARAMS {
            line.push_str(&format!(",p{i},v"));
        }
        assert_eq!(parse_command(&line).unwrap().params.len(), MAX_PARAMS);
        line.push_str(",extra,v");
        assert_eq!(parse_command(&line), Err(ParseError::TooManyParams));
    }

    #[test]
    fn trim_rules() {
        assert_eq!(trim_line("\r\n\t ca_get_version  "), "ca_get_version");
        assert_eq!(trim_line("a,b\t"), "a,b\t");
        assert_eq!(parse_command(trim_line("  \r\n")), Err(ParseError::Empty));
    }

    #[test]
    fn response_framing() {
        assert_eq!(format_response(Status::Running, None), "status,RUNNING\r\n");
        assert_eq!(
            format_response(Status::Complete, Some("version,1.0")),
            "status,COMPLETE,version,1.0\r\n"
        );
        let (s, p) = parse_response("status,INVALID,errorCode,Unknown command\r\n").unwrap();
        assert_eq!(s, Status::Invalid);
        assert_eq!(p, Some("errorCode,Unknown command"));
        assert_eq!(parse_response("status,RUNNING"), Some((Status::Running, None)));
        assert!(parse_response("hello").is_none());
    }
}
