//! Simulated device speaking both wire protocols.
//!
//! [`SimDevice`] is a cloneable handle on shared device state. [`SimLink`] plugs it in as
//! an in-process [`Transport`]; [`serve_udp`] answers ASCII requests on a real socket.
//! [`Faults`] injects the misbehaviour a noisy link or a slow device would show.

use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::agent::{
    Agent, AgentError, AgentOptions, AgentResult, ControlWords, MmpAgent, PAGE_WORDS, ScpiAgent,
    Uri,
};
use crate::frame::{self, Command, Request};
use crate::proto::command::{AsciiCommand, STATUS_READY};
use crate::proto::parser::{format_dump_page, parse_command};
use crate::transport::{MacAddr, ResourceList, Transport, TransportError};

/// Hardware address the device answers from.
pub const DEVICE_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
/// Hardware address [`SimLink`] reports for the host side.
pub const HOST_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// Misbehaviour to inject. Defaults to a well-behaved device.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Replies with a wrong sequence number queued ahead of every genuine one.
    pub stale_replies: u32,
    /// Replies carrying the right sequence number under another command code, queued
    /// ahead of every genuine one.
    pub wrong_command_replies: u32,
    /// Never answer.
    pub drop_replies: bool,
    /// Status byte for register reads. Nonzero makes every read fail.
    pub read_status: u8,
    /// Readiness polls answered "busy" after each arm.
    pub busy_polls: u32,
    /// Page index answered with a truncated page.
    pub short_page: Option<u8>,
    /// Control-register polls before a tuner request completes.
    pub tuner_delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed { busy_left: u32 },
    Ready,
}

struct TunerOp {
    done: u16,
    polls_left: u32,
}

struct State {
    oam: HashMap<(u8, u8), u16>,
    ana: HashMap<u16, u16>,
    tuner: [u8; 256],
    tuner_op: Option<TunerOp>,
    faults: Faults,
    phase: Phase,
    armed: Option<ControlWords>,
    capture: Vec<u32>,
    released: bool,
    requests: u64,
    outbox: VecDeque<Vec<u8>>,
}

/// Shared handle; clones address the same device.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<Mutex<State>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                oam: HashMap::new(),
                ana: HashMap::new(),
                tuner: [0; 256],
                tuner_op: None,
                faults: Faults::default(),
                phase: Phase::Idle,
                armed: None,
                capture: Vec::new(),
                released: false,
                requests: 0,
                outbox: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    /// Preload an OAM register.
    pub fn poke_oam(&self, llid: u8, reg: u8, value: u16) {
        self.state().oam.insert((llid, reg), value);
    }

    pub fn peek_oam(&self, llid: u8, reg: u8) -> Option<u16> {
        self.state().oam.get(&(llid, reg)).copied()
    }

    /// Requests seen so far, answered or not.
    pub fn requests(&self) -> u64 {
        self.state().requests
    }

    /// Replies queued but not yet received by the host.
    pub fn pending_replies(&self) -> usize {
        self.state().outbox.len()
    }

    pub fn armed(&self) -> Option<ControlWords> {
        self.state().armed
    }

    /// Samples the last arm produced.
    pub fn capture(&self) -> Vec<u32> {
        self.state().capture.clone()
    }

    pub fn released(&self) -> bool {
        self.state().released
    }

    /// Feed one binary request frame; replies land in the outbox.
    pub fn handle_frame(&self, buf: &[u8]) {
        let mut st = self.state();
        st.requests += 1;
        let req = match frame::parse_request(buf) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("[sim] ignoring frame: {}", e);
                return;
            }
        };
        if st.faults.drop_replies {
            return;
        }
        let payload = st.execute_frame(&req);
        let code = req.command.response_code();
        for i in 0..st.faults.stale_replies {
            let stale = req.seq.wrapping_add(1 + i as u16);
            let f = frame::build_response(req.src, DEVICE_MAC, code, stale, &payload);
            st.outbox.push_back(f);
        }
        for _ in 0..st.faults.wrong_command_replies {
            let f = frame::build_response(req.src, DEVICE_MAC, code ^ 0x0002, req.seq, &payload);
            st.outbox.push_back(f);
        }
        let f = frame::build_response(req.src, DEVICE_MAC, code, req.seq, &payload);
        st.outbox.push_back(f);
    }

    /// Answer one ASCII request line. `None` means no reply is sent.
    pub fn handle_line(&self, line: &str) -> Option<String> {
        let mut st = self.state();
        st.requests += 1;
        if st.faults.drop_replies {
            return None;
        }
        let reply = match parse_command(line) {
            Ok(cmd) => st.execute_line(cmd),
            Err(e) => {
                log::debug!("[sim] bad line {:?}: {}", line, e);
                "ERR".to_string()
            }
        };
        Some(reply)
    }

    fn push_reply(&self, buf: Vec<u8>) {
        self.state().outbox.push_back(buf);
    }

    fn pop_reply(&self) -> Option<Vec<u8>> {
        self.state().outbox.pop_front()
    }
}

impl State {
    fn read_oam(&mut self, llid: u8, reg: u8) -> u16 {
        if (llid, reg) == (0x7e, 0x74)
            && let Some(op) = self.tuner_op.as_mut()
        {
            if op.polls_left == 0 {
                let done = op.done;
                self.tuner_op = None;
                self.oam.insert((llid, reg), done);
            } else {
                op.polls_left -= 1;
            }
        }
        self.oam.get(&(llid, reg)).copied().unwrap_or(0)
    }

    fn write_oam(&mut self, llid: u8, reg: u8, value: u16) {
        self.oam.insert((llid, reg), value);
        if (llid, reg) != (0x7e, 0x74) {
            return;
        }
        let staged = self.oam.get(&(0x7e, 0x75)).copied().unwrap_or(0);
        let [treg, tdata] = staged.to_be_bytes();
        let done = match value {
            0xf001 => {
                let v = self.tuner[treg as usize];
                self.oam.insert((0x7e, 0x75), u16::from_be_bytes([treg, v]));
                0xf101
            }
            0xf000 => {
                self.tuner[treg as usize] = tdata;
                0xf100
            }
            _ => return,
        };
        self.tuner_op = Some(TunerOp {
            done,
            polls_left: self.faults.tuner_delay,
        });
    }

    fn arm(&mut self, words: ControlWords) {
        let n = words.sample_ceiling();
        self.capture = (0..n as u32)
            .map(|i| i.wrapping_mul(0x9e37_79b9) >> 21)
            .collect();
        self.armed = Some(words);
        self.released = false;
        self.phase = Phase::Armed {
            busy_left: self.faults.busy_polls,
        };
        log::debug!("[sim] armed {:08x?}, {} samples", words, n);
    }

    /// Readiness as seen by one poll. Moves an armed capture to ready once the busy
    /// budget is spent.
    fn poll_ready(&mut self) -> bool {
        match self.phase {
            Phase::Armed { busy_left } if busy_left > 0 => {
                self.phase = Phase::Armed {
                    busy_left: busy_left - 1,
                };
                false
            }
            Phase::Armed { .. } => {
                self.phase = Phase::Ready;
                true
            }
            _ => true,
        }
    }

    fn page(&self, index: usize) -> Vec<u32> {
        (0..PAGE_WORDS)
            .map(|i| self.capture.get(index * PAGE_WORDS + i).copied().unwrap_or(0))
            .collect()
    }

    fn execute_frame(&mut self, req: &Request) -> Vec<u8> {
        let p = &req.payload;
        let byte = |i: usize| p.get(i).copied().unwrap_or(0);
        let word = |i: usize| u16::from_be_bytes([byte(i), byte(i + 1)]);
        match req.command {
            Command::GetOam => {
                let v = self.read_oam(byte(0), byte(1));
                let [hi, lo] = v.to_be_bytes();
                vec![self.faults.read_status, hi, lo]
            }
            Command::SetOam => {
                self.write_oam(byte(0), byte(1), word(2));
                vec![0]
            }
            Command::GetAna => {
                let v = self.ana.get(&(byte(0) as u16)).copied().unwrap_or(0);
                let [hi, lo] = v.to_be_bytes();
                vec![self.faults.read_status, hi, lo]
            }
            Command::SetAna => {
                self.ana.insert(byte(0) as u16, word(1));
                vec![0]
            }
            Command::SetDebugCore => {
                let w = |i: usize| {
                    u32::from_be_bytes([
                        byte(i * 4),
                        byte(i * 4 + 1),
                        byte(i * 4 + 2),
                        byte(i * 4 + 3),
                    ])
                };
                self.arm(ControlWords {
                    clock: w(0),
                    event: w(1),
                    point: w(2),
                    mode: w(3),
                });
                vec![0]
            }
            Command::GetDebugCore => {
                let index = byte(0);
                if index == 0xff {
                    self.phase = Phase::Idle;
                    self.released = true;
                    return vec![0];
                }
                if matches!(self.phase, Phase::Armed { .. }) {
                    return vec![if self.poll_ready() { 0 } else { 4 }];
                }
                let mut out = vec![0];
                for w in self.page(index as usize) {
                    out.extend_from_slice(&w.to_be_bytes());
                }
                if self.faults.short_page == Some(index) {
                    out.truncate(100);
                }
                out
            }
        }
    }

    fn execute_line(&mut self, cmd: AsciiCommand) -> String {
        let ok = || "OK".to_string();
        let read = |status: u8, v: String| if status == 0 { v } else { "ERR".to_string() };
        match cmd {
            AsciiCommand::OamRead { llid, reg } => {
                let v = self.read_oam(llid, reg);
                read(self.faults.read_status, format!("0x{:04x}", v))
            }
            AsciiCommand::OamWrite { llid, reg, value } => {
                self.write_oam(llid, reg, value);
                ok()
            }
            AsciiCommand::AnaRead { reg } => {
                let v = self.ana.get(&reg).copied().unwrap_or(0);
                read(self.faults.read_status, format!("0x{:04x}", v))
            }
            AsciiCommand::AnaWrite { reg, value } => {
                self.ana.insert(reg, value);
                ok()
            }
            AsciiCommand::TunerRead { reg } => {
                read(self.faults.read_status, format!("0x{:02x}", self.tuner[reg as usize]))
            }
            AsciiCommand::TunerWrite { reg, value } => {
                self.tuner[reg as usize] = value;
                ok()
            }
            AsciiCommand::DbgcSet {
                clock,
                event,
                point,
                mode,
            } => {
                self.arm(ControlWords {
                    clock,
                    event,
                    point,
                    mode,
                });
                ok()
            }
            AsciiCommand::DbgcStatus => {
                if self.poll_ready() {
                    STATUS_READY.to_string()
                } else {
                    "BUSY".to_string()
                }
            }
            AsciiCommand::DbgcDump { offset } => {
                let start = (offset as usize).min(self.capture.len());
                let end = (start + PAGE_WORDS).min(self.capture.len());
                let page = format_dump_page(&self.capture[start..end]);
                if self.faults.short_page == Some((start / PAGE_WORDS) as u8) && end > start {
                    // header announces the full page, body is cut short
                    page[..page.len() / 2].to_string()
                } else {
                    page
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Frames,
    Lines,
}

/// In-process transport to a [`SimDevice`]. Replies are available immediately, an empty
/// outbox reads as a timeout without waiting.
pub struct SimLink {
    dev: SimDevice,
    wire: Wire,
}

impl SimLink {
    /// Binary frames.
    pub fn mmp(dev: SimDevice) -> Self {
        Self {
            dev,
            wire: Wire::Frames,
        }
    }

    /// ASCII datagrams.
    pub fn scpi(dev: SimDevice) -> Self {
        Self {
            dev,
            wire: Wire::Lines,
        }
    }
}

impl Transport for SimLink {
    fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self.wire {
            Wire::Frames => self.dev.handle_frame(buf),
            Wire::Lines => {
                let line = String::from_utf8_lossy(buf);
                if let Some(reply) = self.dev.handle_line(&line) {
                    self.dev.push_reply(reply.into_bytes());
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = self.dev.pop_reply().ok_or(TransportError::TimedOut)?;
        buf.truncate(max_len);
        Ok(buf)
    }

    fn local_hw_addr(&self) -> Option<MacAddr> {
        match self.wire {
            Wire::Frames => Some(HOST_MAC),
            Wire::Lines => None,
        }
    }
}

/// `sim://mmp` or `sim://scpi`; each open gets a fresh device.
pub fn open_uri(uri: &Uri, opts: &AgentOptions) -> AgentResult<Box<dyn Agent>> {
    let dev = SimDevice::new();
    match uri.path.to_ascii_lowercase().as_str() {
        "" | "mmp" => Ok(Box::new(MmpAgent::new(
            Box::new(SimLink::mmp(dev)),
            DEVICE_MAC,
            opts,
        ))),
        "scpi" => Ok(Box::new(ScpiAgent::new(Box::new(SimLink::scpi(dev)), opts))),
        other => Err(AgentError::MalformedUri(format!("sim://{other}"))),
    }
}

pub fn list_resources() -> ResourceList {
    let mut out = ResourceList::new();
    out.insert("mmp".into(), "simulated device, binary frames".into());
    out.insert("scpi".into(), "simulated device, ASCII lines".into());
    out
}

/// Answer ASCII requests on `sock` until `stop` is set.
pub fn serve_udp(dev: SimDevice, sock: UdpSocket, stop: Arc<AtomicBool>) -> std::io::Result<()> {
    sock.set_read_timeout(Some(Duration::from_millis(100)))?;
    log::info!("[sim] serving on {}", sock.local_addr()?);
    let mut buf = [0u8; 2048];
    while !stop.load(Ordering::Relaxed) {
        let (n, peer) = match sock.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };
        let line = String::from_utf8_lossy(&buf[..n]);
        if let Some(reply) = dev.handle_line(&line) {
            sock.send_to(reply.as_bytes(), peer)?;
        }
    }
    Ok(())
}
