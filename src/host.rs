use std::ffi::CString;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Everything the command handlers need from the operating system besides
/// the supplicant control sockets.
pub trait Host: Send + Sync {
    /// Run a shell command line and return its exit code.
    fn run(&self, cmd: &str) -> io::Result<i32>;
    /// Run a shell command line and capture stdout.
    fn output(&self, cmd: &str) -> io::Result<String>;
    fn iface_exists(&self, ifname: &str) -> bool;
    fn file_exists(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> io::Result<String>;
    fn write_file(&self, path: &str, contents: &str) -> io::Result<()>;
    fn sleep(&self, d: Duration);
}

/// `sh -c` backed implementation.
#[derive(Debug, Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    fn run(&self, cmd: &str) -> io::Result<i32> {
        debug!("run '{}'", cmd);
        let status = Command::new("sh").arg("-c").arg(cmd).status()?;
        // Killed by a signal counts as a failure.
        Ok(status.code().unwrap_or(-1))
    }

    fn output(&self, cmd: &str) -> io::Result<String> {
        debug!("run '{}' (capture)", cmd);
        let out = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stderr(Stdio::null())
            .output()?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn iface_exists(&self, ifname: &str) -> bool {
        let Ok(name) = CString::new(ifname) else {
            return false;
        };
        unsafe { libc::if_nametoindex(name.as_ptr()) != 0 }
    }

    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn read_file(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &str, contents: &str) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Shell-quote one argument with single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_host_runs_shell() {
        let h = LinuxHost;
        assert_eq!(h.run("exit 3").unwrap(), 3);
        assert_eq!(h.output("echo hello").unwrap(), "hello\n");
        assert!(h.iface_exists("lo"));
        assert!(!h.iface_exists("nonexistent-if0"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
