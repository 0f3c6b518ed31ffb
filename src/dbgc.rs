//! Debug-core capture: trigger configuration, the capture sequence and sample formatters.
//!
//! A capture is described by a [`CaptureConfig`] (event, trigger point, mode and
//! pre-trigger count), usually taken from a named [`Preset`]. [`CaptureEngine`] arms the
//! core, reads the samples back and takes care of the E1 selector register when the
//! trigger event needs it.

use std::str::FromStr;

use thiserror::Error;

use crate::agent::{AgentError, ControlWords};
use crate::register::{self, Registers};

/// Value assumed for the E1 selector when it cannot be read.
pub const E1_FALLBACK: u16 = 0x1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Adc,
    Phy,
}

impl Clock {
    pub fn code(self) -> u32 {
        match self {
            Clock::Adc => 0x00,
            Clock::Phy => 0x10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TxOv,
    RxOv,
    Ov,
    OvPre,
    LdpcErr,
    /// Data valid after LDPC decode.
    CrxDv,
    HdRst,
    /// Generic event picked by the E1 selector register.
    E1,
}

impl Event {
    pub fn code(self) -> u32 {
        let bit: u32 = match self {
            Event::TxOv => 0x8000,
            Event::RxOv => 0x4000,
            Event::Ov => 0x2000,
            Event::OvPre => 0x1000,
            Event::LdpcErr => 0x0800,
            Event::CrxDv => 0x0400,
            Event::HdRst => 0x0200,
            Event::E1 => 0x0100,
        };
        (bit << 16) | 0x0001
    }
}

impl FromStr for Event {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tx_ov" => Ok(Event::TxOv),
            "rx_ov" => Ok(Event::RxOv),
            "ov" => Ok(Event::Ov),
            "ov_pre" => Ok(Event::OvPre),
            "ldpc_err" => Ok(Event::LdpcErr),
            "crx_dv" => Ok(Event::CrxDv),
            "hd_rst" => Ok(Event::HdRst),
            "e1" => Ok(Event::E1),
            _ => Err(()),
        }
    }
}

/// Low nibble of the E1 register when the E1 event is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum E1Select {
    FgFft = 0,
    FgDsm = 1,
    FgUp = 2,
    FgDown = 3,
    FgCrcErr = 4,
    FgRx = 5,
    LdpcOutErr = 6,
    CrxDv = 7,
}

/// How the E1 register is changed before arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E1Apply {
    /// Replace the selector nibble, keep the rest.
    Select(E1Select),
    /// Overwrite the whole register.
    Replace(u16),
    /// Write [`E1_FALLBACK`].
    Default,
}

impl E1Apply {
    pub fn apply(self, original: u16) -> u16 {
        match self {
            E1Apply::Select(sel) => (original & 0xfff0) | sel as u16,
            E1Apply::Replace(v) => v,
            E1Apply::Default => E1_FALLBACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    RxAdc,
    /// Before the RX select.
    FftSelIn,
    RxFrout,
    RxRftfr,
    TxIfft,
    TxIir,
    TxFrout,
}

impl Point {
    pub fn code(self) -> u32 {
        match self {
            Point::RxAdc => 1 << 24,
            Point::FftSelIn => 4 << 24,
            Point::RxFrout => 8 << 24,
            Point::RxRftfr => 16 << 24,
            Point::TxIfft => 4 << 16,
            Point::TxIir => 8 << 16,
            Point::TxFrout => 64 << 16,
        }
    }

    /// The ADC tap only buffers 2048 samples.
    pub fn ceiling(self) -> usize {
        match self {
            Point::RxAdc => 2048,
            _ => 8192,
        }
    }

    pub fn size_mask(self) -> u32 {
        self.ceiling() as u32 - 1
    }

    pub fn clock(self) -> Clock {
        match self {
            Point::RxAdc => Clock::Adc,
            _ => Clock::Phy,
        }
    }
}

impl FromStr for Point {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rx_adc" => Ok(Point::RxAdc),
            "fft_sel_in" => Ok(Point::FftSelIn),
            "rx_frout" => Ok(Point::RxFrout),
            "rx_rftfr" => Ok(Point::RxRftfr),
            "tx_ifft" => Ok(Point::TxIfft),
            "tx_iir" => Ok(Point::TxIir),
            "tx_frout" => Ok(Point::TxFrout),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Free running.
    Normal,
    /// Single shot with a pre-trigger delay.
    Trigger,
}

impl Mode {
    pub fn code(self) -> u32 {
        match self {
            Mode::Normal => 0,
            Mode::Trigger => (1 << 31) | (2 << 29),
        }
    }
}

impl FromStr for Mode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "trigger" => Ok(Mode::Trigger),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pre-trigger count {pre} must stay below the {ceiling}-sample ceiling")]
    PreTrigger { pre: u32, ceiling: usize },
    #[error("{requested} samples exceed the {ceiling}-sample ceiling")]
    SampleCeiling { requested: usize, ceiling: usize },
    #[error("arming failed: {0}")]
    Arm(AgentError),
    #[error("dump failed: {0}")]
    Dump(AgentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub event: Event,
    /// Only used with [`Event::E1`].
    pub e1: E1Apply,
    pub point: Point,
    pub mode: Mode,
    pub pre_trigger: u32,
}

impl CaptureConfig {
    pub fn new(
        event: Event,
        point: Point,
        mode: Mode,
        pre_trigger: u32,
    ) -> Result<Self, CaptureError> {
        if pre_trigger as usize >= point.ceiling() {
            return Err(CaptureError::PreTrigger {
                pre: pre_trigger,
                ceiling: point.ceiling(),
            });
        }
        Ok(Self {
            event,
            e1: E1Apply::Default,
            point,
            mode,
            pre_trigger,
        })
    }

    pub fn with_e1(mut self, apply: E1Apply) -> Self {
        self.e1 = apply;
        self
    }

    pub fn uses_e1(&self) -> bool {
        self.event == Event::E1
    }

    pub fn encode(&self) -> ControlWords {
        ControlWords {
            clock: self.point.clock().code(),
            event: self.event.code(),
            point: self.point.code() | self.point.size_mask(),
            mode: self.mode.code() | self.pre_trigger,
        }
    }
}

/// Named capture setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    RxFftoutError,
    RxFftout,
    FgupRxIir,
    FgupRxAdc,
    RxAdc,
    TxIir,
    FgDsmRxAdc,
    LdpcErrRxAdc,
}

impl Preset {
    pub const ALL: [Preset; 8] = [
        Preset::RxFftoutError,
        Preset::RxFftout,
        Preset::FgupRxIir,
        Preset::FgupRxAdc,
        Preset::RxAdc,
        Preset::TxIir,
        Preset::FgDsmRxAdc,
        Preset::LdpcErrRxAdc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::RxFftoutError => "rx_fftout_error",
            Preset::RxFftout => "rx_fftout",
            Preset::FgupRxIir => "fgup_rx_iir",
            Preset::FgupRxAdc => "fgup_rx_adc",
            Preset::RxAdc => "rx_adc",
            Preset::TxIir => "tx_iir",
            Preset::FgDsmRxAdc => "fg_dsm_rx_adc",
            Preset::LdpcErrRxAdc => "ldpc_err_rx_adc",
        }
    }

    /// Configuration with the preset's own pre-trigger count unless `pre` overrides it.
    pub fn config(self, pre: Option<u32>) -> Result<CaptureConfig, CaptureError> {
        use self::{Event::*, Mode::*};
        let keep = E1Apply::Default;
        let (event, e1, point, mode, default_pre) = match self {
            Preset::RxFftoutError => (LdpcErr, keep, Point::RxRftfr, Trigger, 0x10ff),
            Preset::RxFftout => (OvPre, keep, Point::RxRftfr, Trigger, 0x800),
            Preset::FgupRxIir => {
                (E1, E1Apply::Select(E1Select::FgUp), Point::FftSelIn, Trigger, 0x89f)
            }
            Preset::FgupRxAdc => (E1, E1Apply::Replace(0x1102), Point::RxAdc, Trigger, 0x500),
            Preset::RxAdc => (OvPre, keep, Point::RxAdc, Normal, 0),
            Preset::TxIir => (OvPre, keep, Point::TxIir, Trigger, 0x500),
            Preset::FgDsmRxAdc => {
                (E1, E1Apply::Select(E1Select::FgDsm), Point::RxAdc, Trigger, 0x500)
            }
            Preset::LdpcErrRxAdc => {
                (E1, E1Apply::Select(E1Select::LdpcOutErr), Point::RxAdc, Trigger, 0x500)
            }
        };
        Ok(CaptureConfig::new(event, point, mode, pre.unwrap_or(default_pre))?.with_e1(e1))
    }

    /// Raw ADC samples, suitable for [`AdcFormatter`].
    pub fn is_adc(self) -> bool {
        matches!(
            self,
            Preset::RxAdc | Preset::FgupRxAdc | Preset::FgDsmRxAdc | Preset::LdpcErrRxAdc
        )
    }
}

impl FromStr for Preset {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        Preset::ALL.into_iter().find(|p| p.name() == s).ok_or(())
    }
}

/// Where a capture stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// Control words accepted by the device.
    Armed,
    /// Waiting for the device to finish the capture.
    Polling,
    Ready,
    Dumping,
    Done,
    /// Capture buffer handed back to the device.
    Released,
    Aborted,
}

/// Runs captures through a register handle. One capture at a time.
pub struct CaptureEngine<'r, 'a> {
    regs: &'r mut Registers<'a>,
    state: CaptureState,
    trail: Vec<CaptureState>,
}

impl<'r, 'a> CaptureEngine<'r, 'a> {
    pub fn new(regs: &'r mut Registers<'a>) -> Self {
        Self {
            regs,
            state: CaptureState::Idle,
            trail: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// States entered by the last capture, in order, starting after `Idle`.
    pub fn transitions(&self) -> &[CaptureState] {
        &self.trail
    }

    fn enter(&mut self, next: CaptureState) {
        log::debug!("[dbgc] {:?} -> {:?}", self.state, next);
        self.state = next;
        self.trail.push(next);
    }

    /// Arm, wait and dump. `samples` defaults to the trigger point's ceiling and is
    /// checked against it before anything goes on the wire.
    ///
    /// With the E1 event the selector register is rewritten first and put back
    /// afterwards whatever the outcome; a failed restore is only logged.
    pub fn capture(
        &mut self,
        cfg: &CaptureConfig,
        samples: Option<usize>,
    ) -> Result<Vec<u32>, CaptureError> {
        let ceiling = cfg.point.ceiling();
        let samples = samples.unwrap_or(ceiling);
        if samples > ceiling {
            return Err(CaptureError::SampleCeiling {
                requested: samples,
                ceiling,
            });
        }
        self.state = CaptureState::Idle;
        self.trail.clear();

        let saved = cfg.uses_e1().then(|| self.select_e1(cfg.e1));
        let res = self.arm_and_dump(cfg, samples);
        if let Some(original) = saved
            && let Err(e) = self.regs.write(register::E1, original)
        {
            log::warn!("[dbgc] could not restore E1 to 0x{:04x}: {}", original, e);
        }
        res
    }

    /// Rewrite E1 for the capture and return the value to restore.
    fn select_e1(&mut self, apply: E1Apply) -> u16 {
        let original = match self.regs.read(register::E1) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[dbgc] E1 unreadable ({}), assuming 0x{:04x}", e, E1_FALLBACK);
                E1_FALLBACK
            }
        };
        let value = apply.apply(original);
        if let Err(e) = self.regs.write(register::E1, value) {
            log::warn!("[dbgc] could not set E1 to 0x{:04x}: {}", value, e);
        }
        original
    }

    fn arm_and_dump(
        &mut self,
        cfg: &CaptureConfig,
        samples: usize,
    ) -> Result<Vec<u32>, CaptureError> {
        let words = cfg.encode();
        log::info!(
            "[dbgc] arm clock=0x{:x} event=0x{:08x} point=0x{:08x} mode=0x{:08x}",
            words.clock,
            words.event,
            words.point,
            words.mode
        );
        if let Err(e) = self.regs.agent().setup_debug_core(words) {
            self.enter(CaptureState::Aborted);
            return Err(CaptureError::Arm(e));
        }
        self.enter(CaptureState::Armed);

        let res = self.wait_and_fetch(samples);
        if let Ok(data) = &res {
            self.enter(CaptureState::Done);
            log::info!("[dbgc] captured {} samples", data.len());
        }

        // Released on every path. A failed release does not fail the capture.
        let released = match self.regs.agent().release_debug_core() {
            Ok(sent) => sent,
            Err(e) => {
                log::warn!("[dbgc] debug core release failed: {}", e);
                false
            }
        };
        if released && res.is_ok() {
            self.enter(CaptureState::Released);
        }
        res
    }

    fn wait_and_fetch(&mut self, samples: usize) -> Result<Vec<u32>, CaptureError> {
        self.enter(CaptureState::Polling);
        if let Err(e) = self.regs.agent().wait_debug_core() {
            self.enter(CaptureState::Aborted);
            return Err(CaptureError::Dump(e));
        }
        self.enter(CaptureState::Ready);

        self.enter(CaptureState::Dumping);
        match self.regs.agent().fetch_debug_core(samples) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.enter(CaptureState::Aborted);
                Err(CaptureError::Dump(e))
            }
        }
    }
}

/// Post-processing of raw samples. `None` means the samples could not be interpreted,
/// which is distinct from a failed capture.
pub trait SampleFormatter {
    type Output;
    fn format(&self, samples: &[u32]) -> Option<Self::Output>;
}

/// Capture outcome with the formatter's result kept apart from the raw data.
#[derive(Debug, Clone)]
pub struct Formatted<T> {
    pub raw: Vec<u32>,
    pub formatted: Option<T>,
}

pub fn format_capture<F: SampleFormatter>(raw: Vec<u32>, fmt: &F) -> Formatted<F::Output> {
    let formatted = fmt.format(&raw);
    if formatted.is_none() {
        log::warn!("[dbgc] formatter rejected {} samples", raw.len());
    }
    Formatted { raw, formatted }
}

// Receiver input level (dB) against ADC RMS output, measured on the bench.
const ADC_IN_DB: [f64; 8] = [60.0, 65.0, 70.0, 75.0, 80.0, 85.0, 90.0, 95.0];
const ADC_OUT_RMS: [f64; 8] = [8.0, 12.7, 21.4, 37.0, 66.0, 117.0, 205.0, 358.0];

/// 11-bit ADC word to a signed sample.
pub fn adc_linearize(x: u32) -> i32 {
    if x > 0x400 {
        ((x & 0x7fe) >> 1) as i32 - 0x400
    } else {
        (x >> 1) as i32
    }
}

/// Standard deviation of the samples.
pub fn rms(samples: &[i32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    let sum: f64 = samples.iter().map(|&x| x as f64).sum();
    let sq: f64 = samples.iter().map(|&x| (x as f64) * (x as f64)).sum();
    ((sq - sum * sum / n) / n).max(0.0).sqrt()
}

/// Input level for an ADC RMS reading, log-interpolated on the bench table and
/// extrapolated past either end.
pub fn adc_input_level(rms: f64) -> f64 {
    let last = ADC_OUT_RMS.len() - 1;
    let i = ADC_OUT_RMS
        .iter()
        .rposition(|&o| o <= rms)
        .unwrap_or(0)
        .min(last - 1);
    let af = (rms / ADC_OUT_RMS[i]).ln() / (ADC_OUT_RMS[i + 1] / ADC_OUT_RMS[i]).ln();
    af * (ADC_IN_DB[i + 1] - ADC_IN_DB[i]) + ADC_IN_DB[i]
}

/// Front-end gain in dB from the AGC registers. Unreadable registers count as zero.
pub fn agc_gain_db(agc_set: Option<u16>, agc: Option<u16>) -> f64 {
    let (mut coarse, mut fine) = (0i32, 0i32);
    if let Some(agc) = agc {
        coarse = (agc & 0xf) as i32;
        fine = (agc >> 4) as i32 - 1;
    }
    if let Some(set) = agc_set {
        if set >> 5 != 0 {
            coarse = ((set >> 5) & 0xf) as i32;
        }
        if set & 0x1f != 0 {
            fine = (set & 0x1f) as i32;
        }
    }
    26.0 - coarse as f64 * 3.0 - fine as f64 * 2.0 / 3.0
}

pub fn read_agc_gain(regs: &mut Registers<'_>) -> f64 {
    let agc_set = regs.read(register::AGC_SET).ok();
    let agc = regs.read(register::AGC).ok();
    if let Ok(gd) = regs.read(register::AGC_GD) {
        log::debug!("[dbgc] agc detector 0x{:04x}", gd);
    }
    agc_gain_db(agc_set, agc)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdcReport {
    pub samples: Vec<i32>,
    pub rms: f64,
    /// Estimated receiver input level, 0 for a silent capture.
    pub level_db: f64,
}

/// Linearizes ADC captures and estimates the input level.
#[derive(Debug, Clone, Copy)]
pub struct AdcFormatter {
    pub gain_db: f64,
}

impl SampleFormatter for AdcFormatter {
    type Output = AdcReport;

    fn format(&self, raw: &[u32]) -> Option<AdcReport> {
        if raw.is_empty() {
            return None;
        }
        let samples: Vec<i32> = raw.iter().map(|&x| adc_linearize(x)).collect();
        let rms = rms(&samples);
        let level_db = if rms == 0.0 {
            0.0
        } else {
            adc_input_level(rms) + self.gain_db
        };
        if !level_db.is_finite() {
            return None;
        }
        Some(AdcReport {
            samples,
            rms,
            level_db,
        })
    }
}
