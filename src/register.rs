//! Typed registers on top of an [`Agent`].

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::agent::{Agent, AgentError, LLID_BROADCAST, LLID_SELF};

/// Logical link id of an OAM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Llid(pub u8);

impl Llid {
    pub const SELF: Llid = Llid(LLID_SELF);
    pub const BROADCAST: Llid = Llid(LLID_BROADCAST);
}

impl fmt::Display for Llid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Llid::SELF => f.write_str("self"),
            Llid::BROADCAST => f.write_str("all"),
            Llid(n) => write!(f, "0x{:02x}", n),
        }
    }
}

impl FromStr for Llid {
    type Err = RegisterError;

    /// `self`, `all`, or a number (hex with `0x`, else decimal).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "self" => Ok(Llid::SELF),
            "all" | "broadcast" => Ok(Llid::BROADCAST),
            _ => parse_num(s)
                .and_then(|v| u8::try_from(v).ok())
                .map(Llid)
                .ok_or_else(|| RegisterError::Parse(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Oam(Llid),
    Ana,
    Tuner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub scope: Scope,
    pub addr: u8,
}

impl Register {
    pub const fn oam(llid: Llid, addr: u8) -> Self {
        Self {
            scope: Scope::Oam(llid),
            addr,
        }
    }
    pub const fn ana(addr: u8) -> Self {
        Self {
            scope: Scope::Ana,
            addr,
        }
    }
    pub const fn tuner(addr: u8) -> Self {
        Self {
            scope: Scope::Tuner,
            addr,
        }
    }

    /// Largest value the register holds.
    pub fn max_value(&self) -> u16 {
        match self.scope {
            Scope::Tuner => 0xff,
            _ => 0xffff,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Oam(llid) => write!(f, "oam[{}:0x{:02x}]", llid, self.addr),
            Scope::Ana => write!(f, "ana[0x{:02x}]", self.addr),
            Scope::Tuner => write!(f, "tuner[0x{:02x}]", self.addr),
        }
    }
}

/// Trigger-event selector used by the debug core's E1 event.
pub const E1: Register = Register::oam(Llid::SELF, 0xe1);
/// AGC override.
pub const AGC_SET: Register = Register::oam(Llid::SELF, 0xdc);
/// AGC gain currently applied.
pub const AGC: Register = Register::oam(Llid::SELF, 0x85);
/// AGC gain detector.
pub const AGC_GD: Register = Register::oam(Llid::SELF, 0x8a);
/// Answers on any live device.
pub const PROBE: Register = Register::oam(Llid::SELF, 0xfd);

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("{reg} is {bits} bits wide, 0x{value:x} does not fit")]
    Width { reg: Register, bits: u8, value: u16 },
    #[error("not a register number: {0}")]
    Parse(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Register access through a borrowed agent.
pub struct Registers<'a> {
    agent: &'a mut dyn Agent,
}

impl<'a> Registers<'a> {
    pub fn new(agent: &'a mut dyn Agent) -> Self {
        Self { agent }
    }

    pub fn read(&mut self, reg: Register) -> Result<u16, RegisterError> {
        let v = match reg.scope {
            Scope::Oam(llid) => self.agent.get_oam(llid.0, reg.addr)?,
            Scope::Ana => self.agent.get_ana(reg.addr)?,
            Scope::Tuner => self.agent.get_tuner(reg.addr)? as u16,
        };
        log::debug!("[reg] {} = 0x{:04x}", reg, v);
        Ok(v)
    }

    pub fn write(&mut self, reg: Register, value: u16) -> Result<(), RegisterError> {
        if value > reg.max_value() {
            return Err(RegisterError::Width {
                reg,
                bits: if reg.max_value() == 0xff { 8 } else { 16 },
                value,
            });
        }
        log::debug!("[reg] {} <- 0x{:04x}", reg, value);
        match reg.scope {
            Scope::Oam(llid) => self.agent.set_oam(llid.0, reg.addr, value)?,
            Scope::Ana => self.agent.set_ana(reg.addr, value)?,
            Scope::Tuner => self.agent.set_tuner(reg.addr, value as u8)?,
        }
        Ok(())
    }

    /// Read-modify-write of the bits in `mask`. Returns the value before the change.
    pub fn update_bits(
        &mut self,
        reg: Register,
        mask: u16,
        bits: u16,
    ) -> Result<u16, RegisterError> {
        let old = self.read(reg)?;
        let new = (old & !mask) | (bits & mask);
        if new != old {
            self.write(reg, new)?;
        }
        Ok(old)
    }

    pub fn agent(&mut self) -> &mut dyn Agent {
        &mut *self.agent
    }
}

/// `0x`-prefixed hex or decimal.
pub fn parse_num(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOptions, LinkTiming, MmpAgent};
    use crate::sim::{DEVICE_MAC, SimDevice, SimLink};

    fn agent(dev: &SimDevice) -> MmpAgent {
        let opts = AgentOptions {
            timing: LinkTiming::fast(),
            ..Default::default()
        };
        MmpAgent::new(Box::new(SimLink::mmp(dev.clone())), DEVICE_MAC, &opts)
    }

    #[test]
    fn llid_forms() {
        assert_eq!("self".parse::<Llid>().unwrap(), Llid::SELF);
        assert_eq!("ALL".parse::<Llid>().unwrap(), Llid(0x7f));
        assert_eq!("0x03".parse::<Llid>().unwrap(), Llid(3));
        assert_eq!("12".parse::<Llid>().unwrap(), Llid(12));
        assert!("0x100".parse::<Llid>().is_err());
        assert_eq!(Llid(0x7e).to_string(), "self");
        assert_eq!(E1.to_string(), "oam[self:0xe1]");
    }

    #[test]
    fn typed_round_trip() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        let mut regs = Registers::new(&mut a);
        for (reg, v) in [
            (Register::oam(Llid::SELF, 0xce), 0x0001),
            (Register::oam(Llid(5), 0x10), 0xbeef),
            (Register::ana(0x08), 0x1234),
            (Register::tuner(0x03), 0x5a),
        ] {
            regs.write(reg, v).unwrap();
            assert_eq!(regs.read(reg).unwrap(), v);
        }
    }

    #[test]
    fn tuner_is_eight_bits() {
        let dev = SimDevice::new();
        let mut a = agent(&dev);
        let mut regs = Registers::new(&mut a);
        let before = dev.requests();
        let err = regs.write(Register::tuner(1), 0x100).unwrap_err();
        assert!(matches!(err, RegisterError::Width { bits: 8, .. }));
        assert_eq!(dev.requests(), before);
    }

    #[test]
    fn update_bits_keeps_other_bits() {
        let dev = SimDevice::new();
        dev.poke_oam(0x7e, 0xe1, 0x1236);
        let mut a = agent(&dev);
        let mut regs = Registers::new(&mut a);
        let old = regs.update_bits(E1, 0x000f, 0x0002).unwrap();
        assert_eq!(old, 0x1236);
        assert_eq!(dev.peek_oam(0x7e, 0xe1), Some(0x1232));
    }
}
