//! Binary frame protocol over a raw link.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    Agent, AgentError, AgentOptions, AgentResult, ControlWords, LLID_SELF, LinkTiming, PAGE_WORDS,
    RECV_ATTEMPTS, STATUS_POLLS, TUNER_POLLS, Uri, check_ceiling,
};
use crate::frame::{self, Command, FrameOptions, MAX_FRAME_LEN};
use crate::retry::{Attempt, Budget};
use crate::stats::LinkStats;
use crate::transport::{MacAddr, RawLink, ResourceList, Transport, TransportError};

/// Destination used when the URI names none.
pub const DEFAULT_DST: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

/// Debug-core status reply meaning "capture still running".
const STATUS_BUSY: u8 = 4;
const STATUS_PAGE: u8 = 0x01;
const RELEASE_PAGE: u8 = 0xff;
const PAGE_LEN: usize = 1 + PAGE_WORDS * 4;

// Tuner access is tunnelled through two OAM registers of the local device.
const TUNER_DATA: u8 = 0x75;
const TUNER_CTRL: u8 = 0x74;
const TUNER_READ_REQ: u16 = 0xf001;
const TUNER_READ_DONE: u16 = 0xf101;
const TUNER_WRITE_REQ: u16 = 0xf000;
const TUNER_WRITE_DONE: u16 = 0xf100;

pub struct MmpAgent {
    link: Option<Box<dyn Transport>>,
    src: MacAddr,
    dst: MacAddr,
    opts: FrameOptions,
    timing: LinkTiming,
    rng: StdRng,
    armed: Option<ControlWords>,
    stats: LinkStats,
}

impl MmpAgent {
    /// Build over any transport carrying whole frames.
    pub fn new(link: Box<dyn Transport>, dst: MacAddr, opts: &AgentOptions) -> Self {
        let src = link.local_hw_addr().unwrap_or_default();
        Self {
            link: Some(link),
            src,
            dst,
            opts: opts.frame,
            timing: opts.timing,
            rng: StdRng::from_entropy(),
            armed: None,
            stats: LinkStats::new(),
        }
    }

    /// `mmp://<ifname>[/<dst-mac>]`
    pub fn open_uri(uri: &Uri, opts: &AgentOptions) -> AgentResult<Box<dyn Agent>> {
        let (ifname, dst) = parse_path(&uri.path)?;
        let link = RawLink::open(ifname, frame::ETHERTYPE)?;
        Ok(Box::new(Self::new(Box::new(link), dst, opts)))
    }

    pub fn list_resources() -> ResourceList {
        RawLink::list_resources()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn destination(&self) -> MacAddr {
        self.dst
    }

    /// One request/reply exchange. Returns the reply payload.
    fn transact(&mut self, command: Command, payload: &[u8]) -> AgentResult<Vec<u8>> {
        let link = self.link.as_mut().ok_or(AgentError::Closed)?;
        let seq: u16 = self.rng.gen_range(0..=u16::MAX);
        let out = frame::build_request(self.dst, self.src, self.opts, command, seq, payload);
        link.send(&out)?;
        self.stats.on_send(out.len());
        log::debug!("[mmp] -> {:?} seq=0x{:04x} {:02x?}", command, seq, payload);

        let want = command.response_code();
        let timeout = self.timing.recv_timeout;
        let stats = &mut self.stats;
        let res = Budget::immediate(RECV_ATTEMPTS).run(|_| {
            let buf = match link.recv(MAX_FRAME_LEN, timeout) {
                Ok(buf) => buf,
                Err(TransportError::TimedOut) => {
                    stats.inc_timeouts();
                    return Err(AgentError::TimedOut);
                }
                Err(e) => return Err(e.into()),
            };
            stats.on_recv(buf.len());
            match frame::parse_response(&buf) {
                Ok(r) if r.command == want && r.seq == seq => Ok(Attempt::Ready(r.payload)),
                Ok(r) => {
                    stats.inc_discarded();
                    log::warn!(
                        "[mmp] discard reply cmd=0x{:04x} seq=0x{:04x} (want 0x{:04x}/0x{:04x})",
                        r.command,
                        r.seq,
                        want,
                        seq
                    );
                    Ok(Attempt::Again(AgentError::ProtocolMismatch {
                        command: r.command,
                        seq: r.seq,
                    }))
                }
                Err(e) => {
                    stats.inc_discarded();
                    log::warn!("[mmp] discard frame: {}", e);
                    Ok(Attempt::Again(AgentError::Malformed(e.to_string())))
                }
            }
        });
        if res.is_err() {
            self.stats.inc_failed();
        }
        res
    }

    /// Register reads answer `status, hi, lo`.
    fn read_word(&mut self, command: Command, payload: &[u8]) -> AgentResult<u16> {
        let r = self.transact(command, payload)?;
        match r.as_slice() {
            [0, hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
            [status, _, _, ..] => Err(AgentError::DeviceStatus(*status)),
            _ => Err(AgentError::Malformed(format!("{} byte register reply", r.len()))),
        }
    }

    fn write_ack(&mut self, command: Command, payload: &[u8]) -> AgentResult<()> {
        let r = self.transact(command, payload)?;
        if r.is_empty() {
            return Err(AgentError::Malformed("empty acknowledgement".into()));
        }
        Ok(())
    }

    /// Tuner handshake: stage `reg<<8 | data`, post the request opcode, wait for the
    /// device to echo the matching done opcode, then read the staging register back.
    ///
    /// An exhausted poll cannot be told apart from a device that rejected the request.
    fn tuner_exchange(&mut self, reg: u8, data: u8, write: bool) -> AgentResult<u16> {
        let (req, done) = if write {
            (TUNER_WRITE_REQ, TUNER_WRITE_DONE)
        } else {
            (TUNER_READ_REQ, TUNER_READ_DONE)
        };
        self.set_oam(LLID_SELF, TUNER_DATA, u16::from_be_bytes([reg, data]))?;
        self.set_oam(LLID_SELF, TUNER_CTRL, req)?;

        let budget = Budget::new(TUNER_POLLS, self.timing.tuner_poll);
        budget.run(|_| match self.get_oam(LLID_SELF, TUNER_CTRL) {
            Ok(v) if v == done => Ok(Attempt::Ready(())),
            _ => Ok(Attempt::Again(AgentError::PollExhausted("tuner handshake"))),
        })?;
        self.get_oam(LLID_SELF, TUNER_DATA)
    }

    fn poll_status(&mut self) -> AgentResult<()> {
        let budget = Budget::new(STATUS_POLLS, self.timing.status_poll);
        budget.run(|i| {
            let r = self.transact(Command::GetDebugCore, &[STATUS_PAGE])?;
            match r.first() {
                Some(&STATUS_BUSY) => {
                    log::debug!("[mmp] debug core busy (poll {})", i + 1);
                    Ok(Attempt::Again(AgentError::PollExhausted("debug core busy")))
                }
                Some(_) => Ok(Attempt::Ready(())),
                None => Err(AgentError::Malformed("empty status reply".into())),
            }
        })
    }

    fn fetch_pages(&mut self, samples: usize) -> AgentResult<Vec<u32>> {
        let pages = samples.div_ceil(PAGE_WORDS);
        let mut out = Vec::with_capacity(pages * PAGE_WORDS);
        for page in 0..pages {
            let r = self.transact(Command::GetDebugCore, &[page as u8])?;
            if r.len() < PAGE_LEN {
                return Err(AgentError::Malformed(format!(
                    "page {} is {} bytes, want {}",
                    page,
                    r.len(),
                    PAGE_LEN
                )));
            }
            out.extend(
                r[1..PAGE_LEN]
                    .chunks_exact(4)
                    .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]])),
            );
        }
        Ok(out)
    }
}

impl Agent for MmpAgent {
    fn protocol(&self) -> &'static str {
        "mmp"
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn get_oam(&mut self, llid: u8, reg: u8) -> AgentResult<u16> {
        self.read_word(Command::GetOam, &[llid, reg])
    }

    fn set_oam(&mut self, llid: u8, reg: u8, value: u16) -> AgentResult<()> {
        let [hi, lo] = value.to_be_bytes();
        self.write_ack(Command::SetOam, &[llid, reg, hi, lo])
    }

    fn get_ana(&mut self, reg: u8) -> AgentResult<u16> {
        self.read_word(Command::GetAna, &[reg])
    }

    fn set_ana(&mut self, reg: u8, value: u16) -> AgentResult<()> {
        let [hi, lo] = value.to_be_bytes();
        self.write_ack(Command::SetAna, &[reg, hi, lo])
    }

    fn get_tuner(&mut self, reg: u8) -> AgentResult<u8> {
        let v = self.tuner_exchange(reg, 0, false)?;
        Ok(v as u8)
    }

    fn set_tuner(&mut self, reg: u8, value: u8) -> AgentResult<()> {
        self.tuner_exchange(reg, value, true).map(|_| ())
    }

    fn setup_debug_core(&mut self, words: ControlWords) -> AgentResult<()> {
        let mut payload = Vec::with_capacity(16);
        for w in [words.clock, words.event, words.point, words.mode] {
            payload.extend_from_slice(&w.to_be_bytes());
        }
        let r = self.transact(Command::SetDebugCore, &payload)?;
        match r.first() {
            Some(0) => {
                self.armed = Some(words);
                Ok(())
            }
            Some(s) => Err(AgentError::DeviceStatus(*s)),
            None => Err(AgentError::Malformed("empty arm reply".into())),
        }
    }

    fn armed(&self) -> Option<ControlWords> {
        self.armed
    }

    fn wait_debug_core(&mut self) -> AgentResult<()> {
        self.poll_status()
    }

    fn fetch_debug_core(&mut self, samples: usize) -> AgentResult<Vec<u32>> {
        check_ceiling(self.armed, samples)?;
        self.fetch_pages(samples)
    }

    fn release_debug_core(&mut self) -> AgentResult<bool> {
        self.transact(Command::GetDebugCore, &[RELEASE_PAGE])?;
        Ok(true)
    }

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

/// `<ifname>[/<mac>]`
fn parse_path(path: &str) -> AgentResult<(&str, MacAddr)> {
    let (ifname, mac) = match path.split_once('/') {
        Some((i, m)) => (i, Some(m)),
        None => (path, None),
    };
    if ifname.is_empty() {
        return Err(AgentError::MalformedUri(format!("mmp://{path}: missing interface")));
    }
    let dst = match mac {
        None | Some("") => DEFAULT_DST,
        Some(m) => m
            .parse()
            .map_err(|e| AgentError::Connection(format!("destination: {e}")))?,
    };
    Ok((ifname, dst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Faults, SimDevice, SimLink};

    fn agent(dev: &SimDevice) -> MmpAgent {
        let opts = AgentOptions {
            timing: LinkTiming::fast(),
            ..Default::default()
        };
        MmpAgent::new(Box::new(SimLink::mmp(dev.clone())), DEFAULT_DST, &opts).with_seed(7)
    }

    #[test]
    fn path_forms() {
        assert_eq!(parse_path("eth0").unwrap(), ("eth0", DEFAULT_DST));
        assert_eq!(parse_path("eth0/").unwrap(), ("eth0", DEFAULT_DST));
        let (i, m) = parse_path("eth0/02:00:00:00:00:09").unwrap();
        assert_eq!((i, m), ("eth0", MacAddr([2, 0, 0, 0, 0, 9])));
        assert!(matches!(parse_path("/aabbccddeeff"), Err(AgentError::MalformedUri(_))));
        assert!(matches!(parse_path("eth0/zz"), Err(AgentError::Connection(_))));
    }

    #[test]
    fn oam_set_then_get() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.set_oam(0x7e, 0xce, 0x0001).unwrap();
        assert_eq!(a.get_oam(0x7e, 0xce).unwrap(), 0x0001);
        for (llid, reg, v) in [(0x7f, 0x00, 0xffff), (0x03, 0x85, 0x1234), (0x7e, 0xff, 0)] {
            a.set_oam(llid, reg, v).unwrap();
            assert_eq!(a.get_oam(llid, reg).unwrap(), v);
        }
        assert!(a.probe());
    }

    #[test]
    fn ana_and_tuner_round_trip() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.set_ana(0x08, 0x1234).unwrap();
        assert_eq!(a.get_ana(0x08).unwrap(), 0x1234);
        a.set_tuner(0x03, 0x5a).unwrap();
        assert_eq!(a.get_tuner(0x03).unwrap(), 0x5a);
    }

    #[test]
    fn tuner_waits_for_echo() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            tuner_delay: 5,
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.set_tuner(0x10, 0x42).unwrap();
        assert_eq!(a.get_tuner(0x10).unwrap(), 0x42);

        dev.set_faults(Faults {
            tuner_delay: TUNER_POLLS + 1,
            ..Default::default()
        });
        assert!(matches!(a.get_tuner(0x10), Err(AgentError::PollExhausted(_))));
    }

    #[test]
    fn stale_replies_are_skipped_within_budget() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            stale_replies: RECV_ATTEMPTS - 1,
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.set_oam(0x7e, 0x10, 0xabcd).unwrap();
        assert_eq!(a.stats().discarded, (RECV_ATTEMPTS - 1) as u64);
    }

    #[test]
    fn mismatched_sequence_fails_after_exact_budget() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            stale_replies: RECV_ATTEMPTS,
            ..Default::default()
        });
        let mut a = agent(&dev);
        let err = a.get_oam(0x7e, 0x10).unwrap_err();
        assert!(matches!(err, AgentError::ProtocolMismatch { .. }));
        assert_eq!(a.stats().received, RECV_ATTEMPTS as u64);
        // the genuine reply is still queued behind the stale ones
        assert_eq!(dev.pending_replies(), 1);
    }

    #[test]
    fn replies_for_another_command_are_skipped() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            wrong_command_replies: RECV_ATTEMPTS - 1,
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.set_ana(0x08, 0x0042).unwrap();
        assert_eq!(a.get_ana(0x08).unwrap(), 0x0042);
        assert_eq!(a.stats().discarded, 2 * (RECV_ATTEMPTS - 1) as u64);
    }

    #[test]
    fn wrong_command_code_fails_after_exact_budget() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            wrong_command_replies: RECV_ATTEMPTS,
            ..Default::default()
        });
        let mut a = agent(&dev);
        let err = a.get_oam(0x7e, 0x10).unwrap_err();
        let want = Command::GetOam.response_code() ^ 0x0002;
        assert!(matches!(err, AgentError::ProtocolMismatch { command, .. } if command == want));
        assert_eq!(a.stats().received, RECV_ATTEMPTS as u64);
        assert_eq!(dev.pending_replies(), 1);
    }

    #[test]
    fn silent_device_times_out_without_retransmit() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            drop_replies: true,
            ..Default::default()
        });
        let mut a = agent(&dev);
        assert!(matches!(a.get_ana(0x01), Err(AgentError::TimedOut)));
        assert_eq!(dev.requests(), 1);
        assert_eq!(a.stats().timeouts, 1);
    }

    #[test]
    fn device_status_is_reported() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            read_status: 2,
            ..Default::default()
        });
        let mut a = agent(&dev);
        assert!(matches!(a.get_oam(0x7e, 0x01), Err(AgentError::DeviceStatus(2))));
    }

    #[test]
    fn debug_core_dump_pages_and_release() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            busy_polls: 2,
            ..Default::default()
        });
        let mut a = agent(&dev);
        let words = ControlWords {
            clock: 0x10,
            event: 0x1000_0001,
            point: (16 << 24) | 0x1fff,
            mode: 0xc000_0800,
        };
        a.setup_debug_core(words).unwrap();
        assert_eq!(dev.armed(), Some(words));

        let data = a.dump_debug_core(300).unwrap();
        assert_eq!(data.len(), 3 * PAGE_WORDS);
        assert_eq!(data, dev.capture()[..3 * PAGE_WORDS]);
        assert!(dev.released());
    }

    #[test]
    fn short_page_invalidates_dump() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            short_page: Some(1),
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.setup_debug_core(ControlWords {
            point: (1 << 24) | 0x7ff,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(a.dump_debug_core(512), Err(AgentError::Malformed(_))));
        assert!(dev.released());
    }

    #[test]
    fn busy_device_aborts_dump() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            busy_polls: STATUS_POLLS + 1,
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.setup_debug_core(ControlWords::default()).unwrap();
        assert!(matches!(a.dump_debug_core(1), Err(AgentError::PollExhausted(_))));
    }

    #[test]
    fn ceiling_checked_before_any_traffic() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.setup_debug_core(ControlWords {
            point: (1 << 24) | 0x7ff,
            ..Default::default()
        })
        .unwrap();
        let before = dev.requests();
        let err = a.dump_debug_core(8192).unwrap_err();
        assert!(matches!(err, AgentError::SampleCeiling { ceiling: 2048, .. }));
        assert_eq!(dev.requests(), before);
    }

    #[test]
    fn closed_agent_refuses_work() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.close();
        assert!(matches!(a.get_oam(0x7e, 0), Err(AgentError::Closed)));
    }
}
