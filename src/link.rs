use std::fmt::Write as _;
use std::fs;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};

use c88xx::agent::AgentRegistry;
use c88xx::dbgc::{AdcFormatter, format_capture, read_agc_gain};
use c88xx::session::Session;
use c88xx::sim::{self, SimDevice};

use crate::cli::{CaptureOpts, GetOpts, LinkOpts, SetOpts, SimOpts};

fn open(link: &LinkOpts) -> Result<Session> {
    let registry = AgentRegistry::with_defaults();
    let opts = link.agent_options()?;
    let session =
        Session::open(&registry, &link.uri, &opts).with_context(|| format!("open {}", link.uri))?;
    Ok(session)
}

fn finish(session: &Session) {
    session.with_agent(|a| log::info!("[link] {}", a.stats()));
    session.close();
}

pub fn resources(protocol: Option<&str>) -> Result<()> {
    let registry = AgentRegistry::with_defaults();
    let protocols: Vec<String> = match protocol {
        Some(p) => vec![p.to_ascii_lowercase()],
        None => registry.protocols().map(String::from).collect(),
    };
    for p in protocols {
        let list = registry.list_resources(&p)?;
        println!("{p}:");
        if list.is_empty() {
            println!("  (none)");
        }
        for (name, desc) in list {
            println!("  {name:<20} {desc}");
        }
    }
    Ok(())
}

pub fn probe(opts: &LinkOpts) -> Result<()> {
    let session = open(opts)?;
    let alive = session.probe();
    finish(&session);
    if !alive {
        bail!("{}: no answer", opts.uri);
    }
    println!("{}: alive", opts.uri);
    Ok(())
}

pub fn get(opts: &GetOpts) -> Result<()> {
    let session = open(&opts.link)?;
    let v = session.read(opts.reg);
    finish(&session);
    let v = v.with_context(|| format!("read {}", opts.reg))?;
    println!("{} = 0x{:04x}", opts.reg, v);
    Ok(())
}

pub fn set(opts: &SetOpts) -> Result<()> {
    let session = open(&opts.link)?;
    let res = session.write(opts.reg, opts.value);
    finish(&session);
    res.with_context(|| format!("write {}", opts.reg))?;
    println!("{} <- 0x{:04x}", opts.reg, opts.value);
    Ok(())
}

pub fn capture(opts: &CaptureOpts) -> Result<()> {
    if opts.adc && !opts.preset.is_adc() {
        bail!("--adc needs an ADC capture point, {} is not one", opts.preset.name());
    }
    let cfg = opts.preset.config(opts.pre)?;
    let session = open(&opts.link)?;

    let worker = session.spawn_capture(cfg, opts.samples)?;
    let raw = match worker.join() {
        Ok(raw) => raw,
        Err(e) => {
            finish(&session);
            return Err(e).context(format!("capture {}", opts.preset.name()));
        }
    };
    println!("{}: {} samples", opts.preset.name(), raw.len());

    let raw = if opts.adc {
        let gain_db = session.with_registers(|r| read_agc_gain(r));
        let out = format_capture(raw, &AdcFormatter { gain_db });
        match &out.formatted {
            Some(rep) => println!(
                "rms {:.2}  gain {:.1} dB  input {:.1} dB",
                rep.rms, gain_db, rep.level_db
            ),
            None => println!("samples could not be interpreted"),
        }
        out.raw
    } else {
        raw
    };
    finish(&session);

    if let Some(path) = &opts.out {
        let mut text = String::with_capacity(raw.len() * 9);
        for w in &raw {
            let _ = writeln!(text, "{w:08x}");
        }
        fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

pub fn serve(opts: &SimOpts) -> Result<()> {
    let sock = UdpSocket::bind(opts.bind).with_context(|| format!("bind {}", opts.bind))?;
    println!("simulated device on {}", sock.local_addr()?);
    sim::serve_udp(SimDevice::new(), sock, Arc::new(AtomicBool::new(false)))?;
    Ok(())
}
