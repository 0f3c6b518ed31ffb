//! ASCII command protocol over UDP.

use std::net::SocketAddr;

use super::{
    Agent, AgentError, AgentOptions, AgentResult, ControlWords, LinkTiming, RECV_ATTEMPTS,
    STATUS_POLLS, Uri, check_ceiling,
};
use crate::proto::command::{AsciiCommand, STATUS_READY};
use crate::proto::parser::{format_command, parse_dump_page, parse_hex, reply_token};
use crate::retry::{Attempt, Budget};
use crate::stats::LinkStats;
use crate::transport::{ResourceList, Transport, TransportError, UdpLink};

const MAX_DATAGRAM: usize = 2048;

pub struct ScpiAgent {
    link: Option<Box<dyn Transport>>,
    timing: LinkTiming,
    armed: Option<ControlWords>,
    stats: LinkStats,
}

impl ScpiAgent {
    pub fn new(link: Box<dyn Transport>, opts: &AgentOptions) -> Self {
        Self {
            link: Some(link),
            timing: opts.timing,
            armed: None,
            stats: LinkStats::new(),
        }
    }

    /// `scpi://<ipv4>:<port>`
    pub fn open_uri(uri: &Uri, opts: &AgentOptions) -> AgentResult<Box<dyn Agent>> {
        let peer: SocketAddr = uri
            .path
            .trim_end_matches('/')
            .parse()
            .map_err(|_| AgentError::MalformedUri(format!("scpi://{}: want ip:port", uri.path)))?;
        let link = UdpLink::open(peer)?;
        Ok(Box::new(Self::new(Box::new(link), opts)))
    }

    pub fn list_resources() -> ResourceList {
        UdpLink::list_resources()
    }

    /// Send one line and return the first token of the reply.
    fn query(&mut self, cmd: AsciiCommand) -> AgentResult<String> {
        let link = self.link.as_mut().ok_or(AgentError::Closed)?;
        let line = format_command(&cmd);
        link.send(line.as_bytes())?;
        self.stats.on_send(line.len());
        log::debug!("[scpi] -> {}", line);

        let timeout = self.timing.recv_timeout;
        let stats = &mut self.stats;
        let res = Budget::immediate(RECV_ATTEMPTS).run(|_| {
            let buf = match link.recv(MAX_DATAGRAM, timeout) {
                Ok(buf) => buf,
                Err(TransportError::TimedOut) => {
                    stats.inc_timeouts();
                    return Err(AgentError::TimedOut);
                }
                Err(e) => return Err(e.into()),
            };
            stats.on_recv(buf.len());
            match reply_token(&buf) {
                Some(tok) => Ok(Attempt::Ready(tok)),
                None => {
                    stats.inc_discarded();
                    Ok(Attempt::Again(AgentError::Malformed("blank reply".into())))
                }
            }
        });
        match &res {
            Ok(tok) => log::debug!("[scpi] <- {}", tok),
            Err(_) => self.stats.inc_failed(),
        }
        res
    }

    fn query_hex(&mut self, cmd: AsciiCommand, max: u32) -> AgentResult<u32> {
        let tok = self.query(cmd)?;
        let v = parse_hex("reply", &tok).map_err(|e| AgentError::Malformed(e.to_string()))?;
        if v > max {
            return Err(AgentError::Malformed(format!("{tok} exceeds 0x{max:x}")));
        }
        Ok(v)
    }

    fn poll_status(&mut self) -> AgentResult<()> {
        let budget = Budget::new(STATUS_POLLS, self.timing.status_poll);
        budget.run(|_| {
            let tok = self.query(AsciiCommand::DbgcStatus)?;
            if tok.eq_ignore_ascii_case(STATUS_READY) {
                Ok(Attempt::Ready(()))
            } else {
                Ok(Attempt::Again(AgentError::PollExhausted("debug core busy")))
            }
        })
    }

    /// Pages carry their own length. Stop at an empty page or once enough words arrived.
    /// Whole pages are kept, so the result can run past `samples` up to the page end.
    fn fetch_pages(&mut self, samples: usize) -> AgentResult<Vec<u32>> {
        let mut out = Vec::with_capacity(samples);
        let mut offset = 0usize;
        while offset < samples {
            let tok = self.query(AsciiCommand::DbgcDump {
                offset: offset as u32,
            })?;
            let page = parse_dump_page(&tok).map_err(|e| AgentError::Malformed(e.to_string()))?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            out.extend(page);
        }
        Ok(out)
    }
}

impl Agent for ScpiAgent {
    fn protocol(&self) -> &'static str {
        "scpi"
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn get_oam(&mut self, llid: u8, reg: u8) -> AgentResult<u16> {
        let v = self.query_hex(AsciiCommand::OamRead { llid, reg }, 0xffff)?;
        Ok(v as u16)
    }

    fn set_oam(&mut self, llid: u8, reg: u8, value: u16) -> AgentResult<()> {
        self.query(AsciiCommand::OamWrite { llid, reg, value })
            .map(|_| ())
    }

    fn get_ana(&mut self, reg: u8) -> AgentResult<u16> {
        let v = self.query_hex(AsciiCommand::AnaRead { reg: reg as u16 }, 0xffff)?;
        Ok(v as u16)
    }

    fn set_ana(&mut self, reg: u8, value: u16) -> AgentResult<()> {
        self.query(AsciiCommand::AnaWrite {
            reg: reg as u16,
            value,
        })
        .map(|_| ())
    }

    fn get_tuner(&mut self, reg: u8) -> AgentResult<u8> {
        let v = self.query_hex(AsciiCommand::TunerRead { reg }, 0xff)?;
        Ok(v as u8)
    }

    fn set_tuner(&mut self, reg: u8, value: u8) -> AgentResult<()> {
        self.query(AsciiCommand::TunerWrite { reg, value })
            .map(|_| ())
    }

    fn setup_debug_core(&mut self, words: ControlWords) -> AgentResult<()> {
        self.query(AsciiCommand::DbgcSet {
            clock: words.clock,
            event: words.event,
            point: words.point,
            mode: words.mode,
        })?;
        self.armed = Some(words);
        Ok(())
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

    fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::sim::{Faults, SimDevice, SimLink, serve_udp};

    fn agent(dev: &SimDevice) -> ScpiAgent {
        let opts = AgentOptions {
            timing: LinkTiming::fast(),
            ..Default::default()
        };
        ScpiAgent::new(Box::new(SimLink::scpi(dev.clone())), &opts)
    }

    #[test]
    fn register_round_trips() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.set_oam(0x7e, 0x74, 0x55aa).unwrap();
        assert_eq!(a.get_oam(0x7e, 0x74).unwrap(), 0x55aa);
        a.set_ana(0x08, 0x1234).unwrap();
        assert_eq!(a.get_ana(0x08).unwrap(), 0x1234);
        a.set_tuner(0x03, 0x5a).unwrap();
        assert_eq!(a.get_tuner(0x03).unwrap(), 0x5a);
        for (llid, reg, v) in [(0x7f, 0x01, 0xffff), (0x00, 0xce, 0x8000)] {
            a.set_oam(llid, reg, v).unwrap();
            assert_eq!(a.get_oam(llid, reg).unwrap(), v);
        }
    }

    #[test]
    fn error_token_is_malformed() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            read_status: 1,
            ..Default::default()
        });
        let mut a = agent(&dev);
        assert!(matches!(a.get_ana(0x01), Err(AgentError::Malformed(_))));
    }

    #[test]
    fn timeout_is_single_send() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            drop_replies: true,
            ..Default::default()
        });
        let mut a = agent(&dev);
        assert!(matches!(a.get_tuner(0x03), Err(AgentError::TimedOut)));
        assert_eq!(dev.requests(), 1);
    }

    #[test]
    fn dump_follows_page_lengths() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            busy_polls: 1,
            ..Default::default()
        });
        let mut a = agent(&dev);
        a.setup_debug_core(ControlWords {
            clock: 0,
            event: 0x1000_0001,
            point: (1 << 24) | 0x7ff,
            mode: 0,
        })
        .unwrap();
        let data = a.dump_debug_core(2048).unwrap();
        assert_eq!(data, dev.capture());

        let data = a.dump_debug_core(200).unwrap();
        assert_eq!(data.len(), 256);
        assert_eq!(data, dev.capture()[..256]);
    }

    #[test]
    fn dump_rejects_over_ceiling_and_short_pages() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        a.setup_debug_core(ControlWords {
            point: (1 << 24) | 0x7ff,
            ..Default::default()
        })
        .unwrap();
        let before = dev.requests();
        assert!(matches!(
            a.dump_debug_core(8192),
            Err(AgentError::SampleCeiling { ceiling: 2048, .. })
        ));
        assert_eq!(dev.requests(), before);

        dev.set_faults(Faults {
            short_page: Some(1),
            ..Default::default()
        });
        assert!(matches!(a.dump_debug_core(1024), Err(AgentError::Malformed(_))));
    }

    #[test]
    fn over_real_udp() {
        let dev = SimDevice::new();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let (dev, stop) = (dev.clone(), stop.clone());
            std::thread::spawn(move || serve_udp(dev, sock, stop))
        };

        let uri: Uri = format!("scpi://{addr}").parse().unwrap();
        let mut a = ScpiAgent::open_uri(&uri, &AgentOptions::default()).unwrap();
        a.set_oam(0x7e, 0xce, 0x0001).unwrap();
        assert_eq!(a.get_oam(0x7e, 0xce).unwrap(), 0x0001);
        assert!(a.probe());
        a.close();

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn open_rejects_bad_endpoint() {
        let uri: Uri = "scpi://localhost".parse().unwrap();
        let err = ScpiAgent::open_uri(&uri, &AgentOptions::default()).err().unwrap();
        assert!(matches!(err, AgentError::MalformedUri(_)));
    }
}
