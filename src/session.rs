//! One open agent shared between the caller and a background capture worker.
//!
//! Every call takes the agent lock for its whole duration, so register traffic waits for
//! a running capture to finish. At most one capture runs at a time; a second request is
//! refused with [`SessionError::Busy`] rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::agent::{Agent, AgentError, AgentOptions, AgentRegistry};
use crate::dbgc::{CaptureConfig, CaptureEngine, CaptureError};
use crate::register::{Register, RegisterError, Registers};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a capture is already running")]
    Busy,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("capture worker panicked")]
    Worker,
}

type SharedAgent = Arc<Mutex<Box<dyn Agent>>>;

pub struct Session {
    agent: SharedAgent,
    capturing: Arc<AtomicBool>,
}

impl Session {
    pub fn new(agent: Box<dyn Agent>) -> Self {
        Self {
            agent: Arc::new(Mutex::new(agent)),
            capturing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(
        registry: &AgentRegistry,
        uri: &str,
        opts: &AgentOptions,
    ) -> Result<Self, SessionError> {
        Ok(Self::new(registry.open(uri, opts)?))
    }

    fn lock(agent: &SharedAgent) -> MutexGuard<'_, Box<dyn Agent>> {
        agent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive use of the agent.
    pub fn with_agent<T>(&self, f: impl FnOnce(&mut dyn Agent) -> T) -> T {
        let mut guard = Self::lock(&self.agent);
        f(guard.as_mut())
    }

    pub fn with_registers<T>(&self, f: impl FnOnce(&mut Registers<'_>) -> T) -> T {
        self.with_agent(|agent| f(&mut Registers::new(agent)))
    }

    pub fn read(&self, reg: Register) -> Result<u16, SessionError> {
        Ok(self.with_registers(|r| r.read(reg))?)
    }

    pub fn write(&self, reg: Register, value: u16) -> Result<(), SessionError> {
        Ok(self.with_registers(|r| r.write(reg, value))?)
    }

    pub fn probe(&self) -> bool {
        self.with_agent(|a| a.probe())
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    /// Capture on the calling thread.
    pub fn capture(
        &self,
        cfg: &CaptureConfig,
        samples: Option<usize>,
    ) -> Result<Vec<u32>, SessionError> {
        let _slot = CaptureSlot::claim(&self.capturing)?;
        let data = run_capture(&self.agent, cfg, samples)?;
        Ok(data)
    }

    /// Capture on a worker thread. Fails with [`SessionError::Busy`] while another
    /// capture is in flight.
    pub fn spawn_capture(
        &self,
        cfg: CaptureConfig,
        samples: Option<usize>,
    ) -> Result<CaptureHandle, SessionError> {
        let slot = CaptureSlot::claim(&self.capturing)?;
        let agent = Arc::clone(&self.agent);
        let handle = thread::Builder::new()
            .name("dbgc-capture".into())
            .spawn(move || {
                let _slot = slot;
                run_capture(&agent, &cfg, samples)
            })
            .map_err(|e| {
                SessionError::Agent(AgentError::Connection(format!("spawn worker: {e}")))
            })?;
        Ok(CaptureHandle { handle })
    }

    /// Close the agent. Waits for a running capture to release the lock.
    pub fn close(&self) {
        self.with_agent(|a| a.close());
    }
}

fn run_capture(
    agent: &SharedAgent,
    cfg: &CaptureConfig,
    samples: Option<usize>,
) -> Result<Vec<u32>, CaptureError> {
    let mut guard = Session::lock(agent);
    let mut regs = Registers::new(guard.as_mut());
    CaptureEngine::new(&mut regs).capture(cfg, samples)
}

pub struct CaptureHandle {
    handle: JoinHandle<Result<Vec<u32>, CaptureError>>,
}

impl CaptureHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<Vec<u32>, SessionError> {
        let data = self.handle.join().map_err(|_| SessionError::Worker)??;
        Ok(data)
    }
}

/// Holds the one-capture flag; dropping it clears the flag on every exit path.
struct CaptureSlot(Arc<AtomicBool>);

impl CaptureSlot {
    fn claim(flag: &Arc<AtomicBool>) -> Result<Self, SessionError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for CaptureSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::{LinkTiming, MmpAgent};
    use crate::dbgc::Preset;
    use crate::register::{E1, Llid};
    use crate::sim::{DEVICE_MAC, Faults, SimDevice, SimLink};

    fn session(dev: &SimDevice, timing: LinkTiming) -> Session {
        let opts = AgentOptions {
            timing,
            ..Default::default()
        };
        Session::new(Box::new(MmpAgent::new(
            Box::new(SimLink::mmp(dev.clone())),
            DEVICE_MAC,
            &opts,
        )))
    }

    #[test]
    fn registers_through_session() {
        let dev = SimDevice::new();
        let s = session(&dev, LinkTiming::fast());
        assert!(s.probe());
        s.write(Register::oam(Llid::SELF, 0xce), 1).unwrap();
        assert_eq!(s.read(Register::oam(Llid::SELF, 0xce)).unwrap(), 1);
    }

    #[test]
    fn second_capture_is_rejected_while_first_runs() {
        let dev = SimDevice::new();
        dev.set_faults(Faults {
            busy_polls: 2,
            ..Default::default()
        });
        let timing = LinkTiming {
            status_poll: Duration::from_millis(100),
            ..LinkTiming::fast()
        };
        let s = session(&dev, timing);
        let cfg = Preset::RxAdc.config(None).unwrap();

        let first = s.spawn_capture(cfg, Some(512)).unwrap();
        assert!(s.is_capturing());
        assert!(matches!(s.spawn_capture(cfg, None), Err(SessionError::Busy)));
        assert!(matches!(s.capture(&cfg, None), Err(SessionError::Busy)));

        let data = first.join().unwrap();
        assert_eq!(data.len(), 512);
        assert!(!s.is_capturing());

        let again = s.spawn_capture(cfg, Some(128)).unwrap();
        assert_eq!(again.join().unwrap().len(), 128);
    }

    #[test]
    fn failed_capture_frees_the_slot() {
        let dev = SimDevice::new();
        dev.poke_oam(0x7e, 0xe1, 0x1111);
        dev.set_faults(Faults {
            drop_replies: true,
            ..Default::default()
        });
        let s = session(&dev, LinkTiming::fast());
        let cfg = Preset::FgDsmRxAdc.config(None).unwrap();
        let err = s.capture(&cfg, None).unwrap_err();
        assert!(matches!(err, SessionError::Capture(CaptureError::Arm(_))));
        assert!(!s.is_capturing());

        dev.set_faults(Faults::default());
        assert_eq!(s.read(E1).unwrap(), 0x1111);
        assert_eq!(s.capture(&cfg, Some(128)).unwrap().len(), 128);
    }
}
