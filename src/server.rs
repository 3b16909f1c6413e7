//! TCP front end: up to four harness connections multiplexed with poll(2).
use anyhow::{Context, Result, bail};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatch::{CommandTable, Reply, process_line};
use crate::dut::Dut;
use crate::logging::SummaryLog;
use crate::proto::command::Status;
use crate::proto::parser::{MAX_CMD_LEN, parse_response};

pub const MAX_CONNECTIONS: usize = 4;
const RECV_BUF_LEN: usize = MAX_CMD_LEN + 5;
/// Upper bound on one poll so the stop flags are noticed.
const POLL_TIMEOUT_MS: i32 = 1000;
const LOCAL_CMD_TIMEOUT: Duration = Duration::from_secs(150);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// SIGINT/SIGTERM end the loop; SIGPIPE from a vanished harness is ignored.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_term as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_term as *const () as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Accumulates received bytes and splits them into command lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(RECV_BUF_LEN),
        }
    }

    /// Bytes that still fit before an unterminated line is dropped.
    pub fn space(&self) -> usize {
        RECV_BUF_LEN.saturating_sub(self.buf.len())
    }

    /// Append `data`, returning every line completed by a CR or LF.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        loop {
            let Some(end) = self.buf.iter().position(|b| matches!(b, b'\r' | b'\n')) else {
                if self.buf.len() >= RECV_BUF_LEN {
                    info!("Too long command dropped");
                    self.buf.clear();
                }
                break;
            };
            lines.push(String::from_utf8_lossy(&self.buf[..end]).into_owned());
            let mut next = end + 1;
            while next < self.buf.len() && matches!(self.buf[next], b'\r' | b'\n') {
                next += 1;
            }
            self.buf.drain(..next);
        }
        lines
    }
}

struct Conn {
    stream: TcpStream,
    peer: SocketAddr,
    buf: LineBuffer,
}

#[derive(Default)]
struct Slot {
    conn: Option<Conn>,
    /// An asynchronous command still owes this slot its final status. Only
    /// the traffic generator commands (`traffic_agent_*`) complete that way
    /// and they are not registered, so nothing sets this yet.
    waiting_completion: bool,
}

impl Slot {
    fn free(&self) -> bool {
        self.conn.is_none() && !self.waiting_completion
    }
}

pub struct Server {
    listener: TcpListener,
    slots: [Slot; MAX_CONNECTIONS],
}

impl Server {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        // std sets SO_REUSEADDR on Unix listeners.
        let listener = TcpListener::bind(addr).context("bind")?;
        Ok(Self {
            listener,
            slots: Default::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a signal arrives or `stop` is raised.
    pub fn run(
        &mut self,
        dut: &mut Dut,
        table: &CommandTable,
        summary: Option<&SummaryLog>,
        stop: &AtomicBool,
    ) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        loop {
            if SHUTDOWN.load(Ordering::SeqCst) || stop.load(Ordering::SeqCst) {
                info!("sigma_dut terminating");
                dut.env.stop.store(true, Ordering::SeqCst);
                return Ok(());
            }

            let can_accept = self.slots.iter().any(Slot::free);
            let mut fds = Vec::with_capacity(MAX_CONNECTIONS + 1);
            let mut owners = Vec::with_capacity(MAX_CONNECTIONS + 1);
            if can_accept {
                fds.push(pollfd(self.listener.as_raw_fd()));
                owners.push(None);
            }
            for (i, slot) in self.slots.iter().enumerate() {
                if let Some(conn) = &slot.conn {
                    fds.push(pollfd(conn.stream.as_raw_fd()));
                    owners.push(Some(i));
                }
            }

            debug!("Waiting for next command (can_accept={})", can_accept);
            let res = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != ErrorKind::Interrupted {
                    warn!("poll: {}", err);
                    std::thread::sleep(Duration::from_secs(1));
                }
                continue;
            }
            if res == 0 {
                continue;
            }

            for (fd, owner) in fds.iter().zip(owners) {
                if fd.revents == 0 {
                    continue;
                }
                match owner {
                    None => self.accept(),
                    Some(i) => self.process_conn(i, dut, table, summary),
                }
            }
        }
    }

    fn accept(&mut self) {
        let Some(i) = self.slots.iter().position(Slot::free) else {
            debug!("No room for new connection");
            return;
        };
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    info!("setsockopt TCP_NODELAY: {}", e);
                }
                debug!("Connection {} from {}", i, peer);
                self.slots[i].conn = Some(Conn {
                    stream,
                    peer,
                    buf: LineBuffer::new(),
                });
            }
            Err(e) => info!("accept: {}", e),
        }
    }

    fn process_conn(
        &mut self,
        i: usize,
        dut: &mut Dut,
        table: &CommandTable,
        summary: Option<&SummaryLog>,
    ) {
        let slot = &mut self.slots[i];
        let Some(conn) = slot.conn.as_mut() else {
            return;
        };
        debug!("Read from {}", conn.peer);

        let mut chunk = [0u8; RECV_BUF_LEN];
        let want = conn.buf.space().max(1);
        let n = match conn.stream.read(&mut chunk[..want]) {
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => return,
            Err(e) => {
                info!("recv: {}", e);
                None
            }
        };
        let Some(n) = n else {
            debug!("Close connection from {}", conn.peer);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            slot.conn = None;
            return;
        };
        debug!("Received {} bytes", n);

        for line in conn.buf.push(&chunk[..n]) {
            let mut reply = Reply::new(&mut conn.stream, summary);
            process_line(dut, table, &mut reply, &line);
        }
    }
}

fn pollfd(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Print status lines until a final one, or two RUNNING lines, arrive.
pub fn print_reply(input: impl Read, out: &mut impl Write) -> Result<()> {
    let mut reader = BufReader::new(input);
    let mut running = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            bail!("Could not read response");
        }
        let text = line.trim_end_matches(['\r', '\n']);
        writeln!(out, "{}", text)?;
        if !matches!(parse_response(text), Some((Status::Running, _))) {
            return Ok(());
        }
        running += 1;
        if running == 2 {
            return Ok(());
        }
    }
}

/// `-l`: send one command to a running instance and print its reply.
pub fn run_local_cmd(port: u16, cmd: &str) -> Result<()> {
    if cmd.len() > MAX_CMD_LEN - 4 {
        bail!("Too long command");
    }
    let mut stream = TcpStream::connect(("127.0.0.1", port)).context("connect")?;
    stream.set_read_timeout(Some(LOCAL_CMD_TIMEOUT))?;
    stream
        .write_all(format!("{} \r\n", cmd).as_bytes())
        .context("send")?;
    let stdout = io::stdout();
    print_reply(&stream, &mut stdout.lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmds::build_table;
    use crate::dut::tests::wlan0_dut;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn slot_held_while_completion_pending() {
        assert!(Slot::default().free());
        let held = Slot {
            conn: None,
            waiting_completion: true,
        };
        assert!(!held.free());
    }

    #[test]
    fn lines_split_on_cr_or_lf() {
        let mut b = LineBuffer::new();
        assert!(b.push(b"ca_get_version").is_empty());
        assert_eq!(b.push(b"\r\nsta_get_info,interface,wlan0\n\nfoo"), vec![
            "ca_get_version".to_string(),
            "sta_get_info,interface,wlan0".to_string(),
        ]);
        assert_eq!(b.push(b"\r"), vec!["foo".to_string()]);
        // LF of a split CRLF shows up as an empty line.
        assert_eq!(b.push(b"\n"), vec![String::new()]);
    }

    #[test]
    fn overlong_line_dropped() {
        let mut b = LineBuffer::new();
        assert!(b.push(&vec![b'a'; RECV_BUF_LEN]).is_empty());
        assert_eq!(b.space(), RECV_BUF_LEN);
        assert_eq!(b.push(b"ok\r\n"), vec!["ok".to_string()]);
    }

    #[test]
    fn reply_printing_stops_at_final_status() {
        let mut out = Vec::new();
        print_reply(&b"status,RUNNING\r\nstatus,COMPLETE,version,1.0\r\nextra\r\n"[..], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "status,RUNNING\nstatus,COMPLETE,version,1.0\n");

        let mut out = Vec::new();
        print_reply(&b"status,RUNNING\r\nstatus,RUNNING\r\nstatus,ERROR\r\n"[..], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "status,RUNNING\nstatus,RUNNING\n");

        assert!(print_reply(&b"status,RUNNING\r\n"[..], &mut Vec::new()).is_err());
    }

    fn ask(stream: &TcpStream) -> io::Result<String> {
        (&*stream).write_all(b"ca_get_version\r\n")?;
        let mut reader = BufReader::new(stream);
        let mut text = String::new();
        for _ in 0..2 {
            reader.read_line(&mut text)?;
        }
        Ok(text)
    }

    #[test]
    fn fifth_client_waits_for_a_free_slot() {
        let mut server = Server::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let (mut dut, _, _) = wlan0_dut();
            let table = build_table();
            server.run(&mut dut, &table, None, &flag).unwrap();
        });

        let clients: Vec<TcpStream> = (0..MAX_CONNECTIONS)
            .map(|_| TcpStream::connect(addr).unwrap())
            .collect();
        for c in &clients {
            assert_eq!(ask(c).unwrap(), "status,RUNNING\r\nstatus,COMPLETE,version,1.0\r\n");
        }

        let fifth = TcpStream::connect(addr).unwrap();
        fifth.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        assert!(ask(&fifth).is_err());

        drop(clients);
        fifth.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(&fifth);
        let mut text = String::new();
        reader.read_line(&mut text).unwrap();
        reader.read_line(&mut text).unwrap();
        assert_eq!(text, "status,RUNNING\r\nstatus,COMPLETE,version,1.0\r\n");

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn malformed_line_keeps_connection_open() {
        let mut server = Server::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let (mut dut, _, _) = wlan0_dut();
            server.run(&mut dut, &build_table(), None, &flag).unwrap();
        });

        let mut c = TcpStream::connect(addr).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        c.write_all(b"foo,bar,baz\r\nsta_get_bssid,interface,wlan0\r\n").unwrap();
        let mut reader = BufReader::new(&c);
        let mut text = String::new();
        for _ in 0..3 {
            reader.read_line(&mut text).unwrap();
        }
        assert_eq!(
            text,
            "status,INVALID,errorCode,Unknown command\r\nstatus,RUNNING\r\nstatus,COMPLETE,bssid,00:00:00:00:00:00\r\n"
        );

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
