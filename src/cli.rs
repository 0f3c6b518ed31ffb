use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};

use c88xx::agent::AgentOptions;
use c88xx::dbgc::Preset;
use c88xx::firmware::{BandPreset, Kind};
use c88xx::frame::FrameOptions;
use c88xx::register::{Llid, Register, parse_num};
use c88xx::transport::{MacAddr, udp};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "c88xx-tool",
    about = "C88xx device link, debug-core capture and firmware editor"
)]
pub struct Cli {
    /// Log more (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// List endpoints each protocol can open
    Resources {
        /// Only this protocol
        protocol: Option<String>,
    },
    /// Check that the device answers
    Probe(LinkOpts),
    /// Read a register
    Get(GetOpts),
    /// Write a register
    Set(SetOpts),
    /// Arm the debug core and dump samples
    Capture(CaptureOpts),
    /// Inspect or edit a firmware image
    Fw(FwOpts),
    /// Serve a simulated device over UDP (ASCII protocol)
    Sim(SimOpts),
}

#[derive(Args, Debug, Clone)]
pub struct LinkOpts {
    /// mmp://<ifname>[/<mac>], scpi://<ip>:<port> or sim://mmp|scpi
    #[arg(long, default_value = "sim://mmp")]
    pub uri: String,
    /// Tag binary frames with this 802.1Q VLAN id
    #[arg(long)]
    pub vlan: Option<u16>,
    /// Prefix binary frames with the reflector preamble
    #[arg(long, default_value_t = false)]
    pub reflector: bool,
}

impl LinkOpts {
    pub fn agent_options(&self) -> anyhow::Result<AgentOptions> {
        if let Some(vid) = self.vlan
            && vid > 0x0fff
        {
            bail!("VLAN id {vid} does not fit in 12 bits");
        }
        Ok(AgentOptions {
            frame: FrameOptions {
                vlan: self.vlan,
                reflector: self.reflector,
            },
            ..Default::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct GetOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    /// oam:<llid>:<reg>, ana:<reg> or tuner:<reg>; llid is self, all or a number
    #[arg(value_parser = parse_register)]
    pub reg: Register,
}

#[derive(Args, Debug, Clone)]
pub struct SetOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    #[arg(value_parser = parse_register)]
    pub reg: Register,
    /// 0x-prefixed hex or decimal
    #[arg(value_parser = parse_u16)]
    pub value: u16,
}

#[derive(Args, Debug, Clone)]
pub struct CaptureOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    /// rx_fftout_error, rx_fftout, fgup_rx_iir, fgup_rx_adc, rx_adc, tx_iir, fg_dsm_rx_adc
    /// or ldpc_err_rx_adc
    #[arg(long, default_value = "rx_adc", value_parser = parse_preset)]
    pub preset: Preset,
    /// Samples to dump, rounded up to whole 128-word pages (defaults to the capture
    /// point's ceiling)
    #[arg(long)]
    pub samples: Option<usize>,
    /// Pre-trigger sample count (defaults per preset)
    #[arg(long, value_parser = parse_u32)]
    pub pre: Option<u32>,
    /// Print RMS and input level of an ADC capture
    #[arg(long, default_value_t = false)]
    pub adc: bool,
    /// Write samples here, one hex word per line
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct FwOpts {
    #[command(subcommand)]
    pub action: FwAction,
}

/// Where and how an edited image is written.
#[derive(Args, Debug, Clone)]
pub struct FwSave {
    /// Output file (defaults to rewriting the input)
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Generate a fresh head instead of keeping the loaded one
    #[arg(long, default_value_t = false)]
    pub new_head: bool,
    /// Append the hardware-support list instead of the loaded tail
    #[arg(long, default_value_t = false)]
    pub new_tail: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FwAction {
    /// Summarize an image
    Info { file: PathBuf },
    /// Print both band tables
    Bands { file: PathBuf },
    /// Create an image from scratch
    New {
        /// cnu or clt
        #[arg(long, value_parser = parse_kind)]
        kind: Kind,
        /// eoc or rf
        #[arg(long, default_value = "eoc", value_parser = parse_band_preset)]
        preset: BandPreset,
        out: PathBuf,
    },
    /// Rewrite one band's register entry
    SetBand {
        file: PathBuf,
        index: usize,
        #[arg(value_parser = parse_u16)]
        a08: u16,
        #[arg(value_parser = parse_u16)]
        a13: u16,
        #[arg(value_parser = parse_u16)]
        a15: u16,
        #[arg(value_parser = parse_u16)]
        of9: u16,
        #[command(flatten)]
        save: FwSave,
    },
    /// Rewrite one band's frequency range (MHz)
    SetRange {
        file: PathBuf,
        index: usize,
        low: u8,
        high: u8,
        #[command(flatten)]
        save: FwSave,
    },
    /// Change network identity fields
    SetNet {
        file: PathBuf,
        #[arg(long)]
        ip: Option<Ipv4Addr>,
        #[arg(long)]
        netmask: Option<Ipv4Addr>,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long)]
        mac: Option<MacAddr>,
        #[arg(long)]
        desc: Option<String>,
        #[command(flatten)]
        save: FwSave,
    },
    /// Turn a named option bit on or off
    Flag {
        file: PathBuf,
        name: String,
        #[arg(action = ArgAction::Set)]
        on: bool,
        #[command(flatten)]
        save: FwSave,
    },
    /// Write the boot script and a band preset
    ApplyConfig {
        file: PathBuf,
        #[arg(long, default_value = "eoc", value_parser = parse_band_preset)]
        preset: BandPreset,
        #[command(flatten)]
        save: FwSave,
    },
    /// Copy a CNU image into a CLT image
    AttachCnu {
        file: PathBuf,
        cnu: PathBuf,
        #[command(flatten)]
        save: FwSave,
    },
    /// Recompute the checksum word
    Checksum {
        file: PathBuf,
        #[command(flatten)]
        save: FwSave,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SimOpts {
    /// Address to listen on
    #[arg(long, default_value = udp::DEFAULT_ENDPOINT)]
    pub bind: SocketAddr,
}

/* ---------- value parsers ---------- */

pub fn parse_register(s: &str) -> anyhow::Result<Register> {
    let parts: Vec<&str> = s.split(':').collect();
    let addr = |tok: &str| -> anyhow::Result<u8> {
        parse_num(tok)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| anyhow!("bad register address {tok:?}"))
    };
    match parts.as_slice() {
        ["oam", llid, reg] => {
            let llid: Llid = llid.parse()?;
            Ok(Register::oam(llid, addr(*reg)?))
        }
        ["oam", reg] => Ok(Register::oam(Llid::SELF, addr(*reg)?)),
        ["ana", reg] => Ok(Register::ana(addr(*reg)?)),
        ["tuner", reg] => Ok(Register::tuner(addr(*reg)?)),
        _ => bail!("register must be oam:<llid>:<reg>, ana:<reg> or tuner:<reg>"),
    }
}

pub fn parse_u16(s: &str) -> anyhow::Result<u16> {
    parse_num(s)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| anyhow!("{s:?} is not a 16-bit number"))
}

pub fn parse_u32(s: &str) -> anyhow::Result<u32> {
    parse_num(s).ok_or_else(|| anyhow!("{s:?} is not a number"))
}

fn parse_preset(s: &str) -> anyhow::Result<Preset> {
    s.parse().map_err(|_| anyhow!("unknown capture preset {s:?}"))
}

fn parse_kind(s: &str) -> anyhow::Result<Kind> {
    s.parse().map_err(|_| anyhow!("kind must be cnu or clt"))
}

fn parse_band_preset(s: &str) -> anyhow::Result<BandPreset> {
    s.parse().map_err(|_| anyhow!("band preset must be eoc or rf"))
}
