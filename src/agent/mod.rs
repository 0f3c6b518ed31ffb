//! Device agents: one uniform register and debug-core interface over two wire protocols.
//!
//! An agent is opened from a URI of the form `<protocol>://<path>` through an
//! [`AgentRegistry`]. The registry is built once at startup and handed to whoever opens
//! agents; there is no process-wide table.
//!
//! | protocol | path                    | wire                       |
//! |----------|-------------------------|----------------------------|
//! | `mmp`    | `eth0[/aa:bb:cc:dd:ee:ff]` | binary frames on a raw link |
//! | `scpi`   | `127.0.0.1:5024`        | ASCII lines over UDP        |
//! | `sim`    | `mmp` or `scpi`         | in-process simulated device |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameOptions;
use crate::stats::LinkStats;
use crate::transport::{ResourceList, TransportError};

pub mod mmp;
pub mod scpi;

pub use mmp::MmpAgent;
pub use scpi::ScpiAgent;

/// Receives per request: the first one plus three retries. Only receives are retried,
/// the request is never sent twice.
pub const RECV_ATTEMPTS: u32 = 4;
/// Debug-core readiness polls before a dump gives up.
pub const STATUS_POLLS: u32 = 3;
/// Tuner handshake polls of the control register.
pub const TUNER_POLLS: u32 = 10;
/// Samples per debug-core page.
pub const PAGE_WORDS: usize = 128;
/// Largest capture any trigger point can hold.
pub const MAX_SAMPLES: usize = 8192;

/// Logical link id addressing the local device.
pub const LLID_SELF: u8 = 0x7e;
/// Logical link id addressing every remote device.
pub const LLID_BROADCAST: u8 = 0x7f;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("malformed uri: {0}")]
    MalformedUri(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport: {0}")]
    Transport(TransportError),

    #[error("no reply within the receive timeout")]
    TimedOut,

    /// Every reply inside the retry budget carried the wrong command echo or sequence.
    #[error("reply mismatch (command 0x{command:04x}, seq 0x{seq:04x})")]
    ProtocolMismatch { command: u16, seq: u16 },

    #[error("device reported status {0}")]
    DeviceStatus(u8),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("gave up polling: {0}")]
    PollExhausted(&'static str),

    #[error("{requested} samples exceed the trigger point ceiling of {ceiling}")]
    SampleCeiling { requested: usize, ceiling: usize },

    #[error("agent is closed")]
    Closed,
}

impl AgentError {
    /// Field errors a caller may simply try again. Open-time errors are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::TimedOut
                | AgentError::ProtocolMismatch { .. }
                | AgentError::DeviceStatus(_)
                | AgentError::Malformed(_)
                | AgentError::PollExhausted(_)
        )
    }
}

impl From<TransportError> for AgentError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::TimedOut => AgentError::TimedOut,
            TransportError::Connection(s) => AgentError::Connection(s),
            other => AgentError::Transport(other),
        }
    }
}

/// Blocking waits of one agent. Fixed when the agent is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    pub recv_timeout: Duration,
    pub status_poll: Duration,
    pub tuner_poll: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(1),
            status_poll: Duration::from_millis(500),
            tuner_poll: Duration::from_millis(200),
        }
    }
}

impl LinkTiming {
    /// Short waits for in-process devices.
    pub fn fast() -> Self {
        Self {
            recv_timeout: Duration::from_millis(50),
            status_poll: Duration::from_millis(1),
            tuner_poll: Duration::from_millis(1),
        }
    }
}

/// Open-time settings shared by all protocols. Each protocol reads what applies to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentOptions {
    pub timing: LinkTiming,
    pub frame: FrameOptions,
}

/// The four debug-core control words, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlWords {
    pub clock: u32,
    pub event: u32,
    pub point: u32,
    pub mode: u32,
}

impl ControlWords {
    /// Capture depth encoded in the trigger point's size mask.
    pub fn sample_ceiling(&self) -> usize {
        (self.point & 0x1fff) as usize + 1
    }
}

/// Uniform device interface. Calls are blocking and must be serialized by the caller.
pub trait Agent: Send {
    fn protocol(&self) -> &'static str;

    /// Release the transport. Later calls fail with [`AgentError::Closed`].
    fn close(&mut self);

    fn get_oam(&mut self, llid: u8, reg: u8) -> AgentResult<u16>;
    fn set_oam(&mut self, llid: u8, reg: u8, value: u16) -> AgentResult<()>;

    fn get_ana(&mut self, reg: u8) -> AgentResult<u16>;
    fn set_ana(&mut self, reg: u8, value: u16) -> AgentResult<()>;

    fn get_tuner(&mut self, reg: u8) -> AgentResult<u8>;
    fn set_tuner(&mut self, reg: u8, value: u8) -> AgentResult<()>;

    /// Arm the debug core.
    fn setup_debug_core(&mut self, words: ControlWords) -> AgentResult<()>;

    /// Control words of the last accepted arm.
    fn armed(&self) -> Option<ControlWords>;

    /// Poll until the armed capture can be read.
    fn wait_debug_core(&mut self) -> AgentResult<()>;

    /// Read whole pages until `samples` words are covered, so the result may run on to
    /// the end of the last page.
    fn fetch_debug_core(&mut self, samples: usize) -> AgentResult<Vec<u32>>;

    /// Hand the capture buffer back to the device. `Ok(false)` when the protocol has no
    /// release step.
    fn release_debug_core(&mut self) -> AgentResult<bool> {
        Ok(false)
    }

    /// Wait, fetch and release. The release goes out whatever the dump's outcome and
    /// its own failure is only logged.
    fn dump_debug_core(&mut self, samples: usize) -> AgentResult<Vec<u32>> {
        check_ceiling(self.armed(), samples)?;
        let res = self
            .wait_debug_core()
            .and_then(|_| self.fetch_debug_core(samples));
        if let Err(e) = self.release_debug_core() {
            log::warn!("[{}] debug core release failed: {}", self.protocol(), e);
        }
        res
    }

    fn stats(&self) -> &LinkStats;

    /// Liveness check: the device answers a read of its own OAM space.
    fn probe(&mut self) -> bool {
        self.get_oam(LLID_SELF, 0xfd).is_ok()
    }
}

/// Sample-count check shared by both protocols, done before any traffic.
pub(crate) fn check_ceiling(armed: Option<ControlWords>, samples: usize) -> AgentResult<()> {
    let ceiling = armed.map_or(MAX_SAMPLES, |w| w.sample_ceiling().min(MAX_SAMPLES));
    if samples > ceiling {
        return Err(AgentError::SampleCeiling {
            requested: samples,
            ceiling,
        });
    }
    Ok(())
}

/// `<protocol>://<path>`; the protocol is matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub protocol: String,
    pub path: String,
}

impl FromStr for Uri {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, path) = s
            .split_once("://")
            .ok_or_else(|| AgentError::MalformedUri(s.to_string()))?;
        if proto.is_empty() || !proto.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AgentError::MalformedUri(s.to_string()));
        }
        Ok(Uri {
            protocol: proto.to_ascii_lowercase(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.path)
    }
}

pub type OpenFn = fn(&Uri, &AgentOptions) -> AgentResult<Box<dyn Agent>>;
pub type ResourcesFn = fn() -> ResourceList;

#[derive(Clone, Copy)]
struct Entry {
    open: OpenFn,
    resources: ResourcesFn,
}

/// Protocol name -> agent constructor.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    entries: BTreeMap<String, Entry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `mmp`, `scpi` and the in-process `sim` device.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("mmp", MmpAgent::open_uri, MmpAgent::list_resources);
        reg.register("scpi", ScpiAgent::open_uri, ScpiAgent::list_resources);
        reg.register("sim", crate::sim::open_uri, crate::sim::list_resources);
        reg
    }

    /// Register a protocol. A second registration under the same name replaces the first.
    pub fn register(&mut self, name: &str, open: OpenFn, resources: ResourcesFn) {
        let key = name.to_ascii_lowercase();
        if self.entries.contains_key(&key) {
            log::warn!("[agent] protocol '{}' registered twice, replacing", key);
        }
        self.entries.insert(key, Entry { open, resources });
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn open(&self, uri: &str, opts: &AgentOptions) -> AgentResult<Box<dyn Agent>> {
        let uri: Uri = uri.parse()?;
        let entry = self
            .entries
            .get(&uri.protocol)
            .ok_or_else(|| AgentError::UnknownProtocol(uri.protocol.clone()))?;
        let agent = (entry.open)(&uri, opts)?;
        log::info!("[agent] opened {}", uri);
        Ok(agent)
    }

    /// Endpoints a protocol could open. Needs no open agent.
    pub fn list_resources(&self, protocol: &str) -> AgentResult<ResourceList> {
        let key = protocol.to_ascii_lowercase();
        let entry = self
            .entries
            .get(&key)
            .ok_or(AgentError::UnknownProtocol(key))?;
        Ok((entry.resources)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        let u: Uri = "MMP://eth0/aabbccddeeff".parse().unwrap();
        assert_eq!(u.protocol, "mmp");
        assert_eq!(u.path, "eth0/aabbccddeeff");
        assert_eq!(u.to_string(), "mmp://eth0/aabbccddeeff");

        assert!(matches!("eth0".parse::<Uri>(), Err(AgentError::MalformedUri(_))));
        assert!(matches!("://x".parse::<Uri>(), Err(AgentError::MalformedUri(_))));
        assert!(matches!("m-p://x".parse::<Uri>(), Err(AgentError::MalformedUri(_))));
    }

    #[test]
    fn registry_rejects_unknown_protocol() {
        let reg = AgentRegistry::with_defaults();
        let protos: Vec<&str> = reg.protocols().collect();
        assert_eq!(protos, ["mmp", "scpi", "sim"]);

        let err = reg.open("usb://0", &AgentOptions::default()).err().unwrap();
        assert!(matches!(err, AgentError::UnknownProtocol(p) if p == "usb"));
        assert!(reg.list_resources("usb").is_err());
        assert!(reg.list_resources("SCPI").unwrap().contains_key("127.0.0.1:5024"));
    }

    #[test]
    fn registry_accepts_injected_protocols() {
        fn refuse(_: &Uri, _: &AgentOptions) -> AgentResult<Box<dyn Agent>> {
            Err(AgentError::Connection("bench offline".into()))
        }
        fn none() -> ResourceList {
            ResourceList::new()
        }
        let mut reg = AgentRegistry::new();
        reg.register("Bench", refuse, none);
        let err = reg.open("bench://x", &AgentOptions::default()).err().unwrap();
        assert!(matches!(err, AgentError::Connection(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn ceiling_follows_armed_point() {
        let adc = ControlWords {
            point: (1 << 24) | 0x7ff,
            ..Default::default()
        };
        assert_eq!(adc.sample_ceiling(), 2048);
        assert!(check_ceiling(Some(adc), 2048).is_ok());
        assert!(matches!(
            check_ceiling(Some(adc), 8192),
            Err(AgentError::SampleCeiling { requested: 8192, ceiling: 2048 })
        ));
        assert!(check_ceiling(None, 8192).is_ok());
        assert!(check_ceiling(None, 8193).is_err());
    }

    #[test]
    fn timeouts_map_to_agent_timeout() {
        assert!(matches!(AgentError::from(TransportError::TimedOut), AgentError::TimedOut));
        assert!(AgentError::TimedOut.is_recoverable());
    }
}
