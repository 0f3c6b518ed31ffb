use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use c88xx::firmware::fields::flag_by_name;
use c88xx::firmware::{
    BandRange, BandReg, FLAGS, FirmwareError, FirmwareImage, Kind, SaveOptions, check_cnu_id,
};

use crate::cli::{FwAction, FwSave};

pub fn run(action: FwAction) -> Result<()> {
    match action {
        FwAction::Info { file } => info(&file),
        FwAction::Bands { file } => bands(&file),
        FwAction::New { kind, preset, out } => {
            let mut img = FirmwareImage::blank(kind);
            img.set_eoc_type(kind);
            img.set_http_header_template();
            img.apply_config(preset);
            img.checksum();
            img.save(&out, &SaveOptions::new(kind))
                .with_context(|| format!("write {}", out.display()))?;
            println!("{}: new {} image, {} bands", out.display(), kind, preset.name());
            Ok(())
        }
        FwAction::SetBand {
            file,
            index,
            a08,
            a13,
            a15,
            of9,
            save,
        } => edit(&file, &save, |img| {
            editable_bands(img)?;
            img.set_band_reg(index, BandReg::new(a08, a13, a15, of9))?;
            Ok(())
        }),
        FwAction::SetRange {
            file,
            index,
            low,
            high,
            save,
        } => edit(&file, &save, |img| {
            editable_bands(img)?;
            img.set_band_range(index, BandRange { low, high })?;
            Ok(())
        }),
        FwAction::SetNet {
            file,
            ip,
            netmask,
            gateway,
            mac,
            desc,
            save,
        } => edit(&file, &save, |img| {
            if let Some(ip) = ip {
                img.set_ip(ip);
            }
            if let Some(nm) = netmask {
                img.set_netmask(nm);
            }
            if let Some(gw) = gateway {
                img.set_gateway(gw);
            }
            if let Some(mac) = mac {
                img.set_mac(mac);
            }
            if let Some(desc) = &desc {
                img.set_user_description(desc);
            }
            Ok(())
        }),
        FwAction::Flag {
            file,
            name,
            on,
            save,
        } => edit(&file, &save, |img| {
            let Some(flag) = flag_by_name(&name) else {
                let names: Vec<&str> = FLAGS.iter().map(|(n, _)| *n).collect();
                bail!("unknown flag {name:?}, expected one of {}", names.join(", "));
            };
            img.set_flag(flag, on);
            Ok(())
        }),
        FwAction::ApplyConfig {
            file,
            preset,
            save,
        } => edit(&file, &save, |img| {
            img.apply_config(preset);
            Ok(())
        }),
        FwAction::AttachCnu { file, cnu, save } => {
            let cnu_file = fs::read(&cnu).with_context(|| format!("read {}", cnu.display()))?;
            if Kind::classify(cnu_file.len())? != Kind::Cnu {
                bail!("{} is not a CNU image", cnu.display());
            }
            edit(&file, &save, |img| {
                if img.kind() != Kind::Clt {
                    bail!("only a CLT image carries an embedded CNU image");
                }
                img.attach_cnu_firmware(&cnu_file)?;
                Ok(())
            })
        }
        FwAction::Checksum { file, save } => edit(&file, &save, |_| Ok(())),
    }
}

fn load(file: &Path) -> Result<FirmwareImage> {
    FirmwareImage::load(file).with_context(|| format!("load {}", file.display()))
}

/// Load, apply `f`, refresh the checksum and write back.
fn edit(
    file: &Path,
    save: &FwSave,
    f: impl FnOnce(&mut FirmwareImage) -> Result<()>,
) -> Result<()> {
    let mut img = load(file)?;
    f(&mut img)?;
    let csum = img.checksum();
    let opts = SaveOptions {
        kind: img.kind(),
        preserve_head: !save.new_head,
        preserve_tail: !save.new_tail,
    };
    let out = save.out.as_deref().unwrap_or(file);
    img.save(out, &opts)
        .with_context(|| format!("write {}", out.display()))?;
    println!(
        "{}: {} image, checksum 0x{:08x}{}",
        out.display(),
        img.kind(),
        csum,
        if img.is_dirty() { "" } else { " (unchanged)" }
    );
    Ok(())
}

fn editable_bands(img: &FirmwareImage) -> Result<()> {
    match img.band_reg_list() {
        Ok(_) => Ok(()),
        Err(FirmwareError::BandAna15Unsupported) => {
            bail!("this image predates editable band tables")
        }
        Err(e) => Err(e.into()),
    }
}

fn info(file: &Path) -> Result<()> {
    let img = load(file)?;
    println!("kind          {}", img.kind());
    println!("checksum      0x{:08x} ({})", img.word(0)?, ok(img.checksum_ok()));
    if img.kind() == Kind::Clt {
        println!("embedded cnu  {}", ok(img.embedded_checksum_ok()));
    }
    if let (Some(id), Some(rec)) = (img.cnu_id(), img.head_record()) {
        println!("head id       {} ({})", id, ok(check_cnu_id(rec)));
    }
    println!("role byte     {}", img.eoc_type());
    println!("revision      0x{:04x}", img.revision());
    println!("ip            {}/{} via {}", img.ip(), img.netmask(), img.gateway());
    println!("default ip    {}", img.default_ip());
    println!("mac           {}", img.mac());
    println!("vlan          {} id {}", on_off(img.vlan_enabled()), img.vlan_id());
    println!("default band  {}", img.default_band());
    println!("soft mode id  {}", img.soft_mode_id());
    println!("description   {:?}", img.user_description());
    match img.script() {
        Ok(records) => println!("boot script   {} records", records.len()),
        Err(e) => println!("boot script   unreadable: {e}"),
    }
    for (name, flag) in FLAGS {
        println!("  {:<22} {}", name, on_off(img.flag(*flag)));
    }
    if let Some(fi) = img.factory_info() {
        println!(
            "factory       tx corr 0x{:02x}, rx corr 0x{:02x}",
            fi.tx_correction(),
            fi.rx_correction()
        );
    }
    Ok(())
}

fn bands(file: &Path) -> Result<()> {
    let img = load(file)?;
    match img.band_reg_list() {
        Ok(list) => {
            println!("idx  ana08   ana13   ana15   oamf9");
            for (i, b) in list.iter().enumerate() {
                println!(
                    "{i:<4} 0x{:04x}  0x{:04x}  0x{:04x}  0x{:04x}",
                    b.a08, b.a13, b.a15, b.of9
                );
            }
        }
        Err(FirmwareError::BandAna15Unsupported) => {
            println!("register table uses the older layout, not editable")
        }
        Err(e) => return Err(e.into()),
    }
    for (i, r) in img.band_range_list()?.iter().enumerate() {
        println!("range {i}: {}..{} MHz", r.low, r.high);
    }
    Ok(())
}

fn ok(good: bool) -> &'static str {
    if good { "ok" } else { "BAD" }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}
