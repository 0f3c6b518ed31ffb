//! Byte pipes to a device: raw link-layer frames or UDP datagrams.
//!
//! A transport never retries. A receive that sees nothing within its timeout reports
//! [`TransportError::TimedOut`] and leaves the decision to the protocol above it.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub mod raw;
pub mod udp;

pub use raw::RawLink;
pub use udp::UdpLink;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("receive timed out")]
    TimedOut,
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Bidirectional byte pipe owned by exactly one agent.
pub trait Transport: Send {
    fn send(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame/datagram of at most `max_len` bytes.
    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self) {}

    /// Hardware address of the local interface, for link-layer transports.
    fn local_hw_addr(&self) -> Option<MacAddr> {
        None
    }
}

/// Which transport backends this build can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub link_layer: bool,
    pub datagram: bool,
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        link_layer: raw::SUPPORTED,
        datagram: true,
    }
}

/// Resource id -> human readable description.
pub type ResourceList = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed hardware address: {0}")]
pub struct MacParseError(pub String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_string());
        let parts: Vec<&str> = if s.contains(':') || s.contains('-') {
            s.split([':', '-']).collect()
        } else {
            if s.len() != 12 || !s.is_ascii() {
                return Err(err());
            }
            (0..12).step_by(2).map(|i| &s[i..i + 2]).collect()
        };
        if parts.len() != 6 {
            return Err(err());
        }
        let mut out = [0u8; 6];
        for (o, p) in out.iter_mut().zip(parts) {
            if p.is_empty() || p.len() > 2 {
                return Err(err());
            }
            *o = u8::from_str_radix(p, 16).map_err(|_| err())?;
        }
        Ok(MacAddr(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_forms() {
        let want = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!("aa:bb:cc:dd:ee:ff".parse::<MacAddr>().unwrap(), want);
        assert_eq!("AA-BB-CC-DD-EE-FF".parse::<MacAddr>().unwrap(), want);
        assert_eq!("aabbccddeeff".parse::<MacAddr>().unwrap(), want);
        assert_eq!(want.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!("aabbccddee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:fff".parse::<MacAddr>().is_err());
    }
}
