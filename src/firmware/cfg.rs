//! Boot-time register scripts and band presets.
//!
//! A script is a run of records starting at 0x500, each led by a tag byte whose low
//! nibble is the record kind and whose high nibble says when it runs. A zero tag ends it.

use std::str::FromStr;

use super::band::{BandRange, BandReg, RANGE_TABLE, REG_TABLE};
use super::{FirmwareError, FirmwareImage, FirmwareResult, Kind};

const SCRIPT: usize = 0x500;
const SCRIPT_LEN: usize = 0x200;
const SOFT_MODE_ID: usize = 0x1f4;
const DEFAULT_SOFT_MODE_ID: &str = "000000000000";
/// Tuner id word in front of the range table.
const TUNER_ID: u16 = 0xfd83;

const KIND_MASK: u8 = 0x0f;
const END: u8 = 0x00;
const OAM: u8 = 0x01;
const ANA: u8 = 0x02;
const PP: u8 = 0x03;
/// Run once the link is up.
pub const TIME_STABLE: u8 = 0x10;

const LLID_SELF: u8 = 0x7e;
const PLL: u16 = 0x29e3;
const TX_POWER: u16 = 0x1306;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Ana {
        reg: u8,
        value: u16,
    },
    Oam {
        llid: u8,
        reg: u8,
        value: u16,
    },
    /// Packet-processor match rule.
    Pp {
        stable: bool,
        trx: u8,
        rule: u8,
        addr: u8,
        offset: u8,
        data: [u8; 6],
        mask: [u8; 6],
        ctr: u8,
    },
}

impl Record {
    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Record::Ana { reg, value } => {
                out.extend_from_slice(&[ANA, reg]);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Record::Oam { llid, reg, value } => {
                out.extend_from_slice(&[OAM, llid, reg]);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Record::Pp {
                stable,
                trx,
                rule,
                addr,
                offset,
                data,
                mask,
                ctr,
            } => {
                let tag = if stable { PP | TIME_STABLE } else { PP };
                out.extend_from_slice(&[tag, trx, rule, addr, offset]);
                out.extend_from_slice(&data);
                out.extend_from_slice(&mask);
                out.push(ctr);
            }
        }
    }
}

const fn ana(reg: u8, value: u16) -> Record {
    Record::Ana { reg, value }
}

const fn oam(reg: u8, value: u16) -> Record {
    Record::Oam {
        llid: LLID_SELF,
        reg,
        value,
    }
}

/// Pass-through rule for data frames in one direction.
const fn pp_data(trx: u8) -> Record {
    Record::Pp {
        stable: true,
        trx,
        rule: 0,
        addr: 0,
        offset: 0x08,
        data: [0; 6],
        mask: [0xff; 6],
        ctr: 0x2,
    }
}

pub const CNU_SCRIPT: &[Record] = &[
    ana(0x08, PLL),
    ana(0x13, 0x5ee0), // dac clock inverted
    ana(0x15, 0x0001),
    oam(0xf9, 0x1800),
    oam(0xe1, TX_POWER),
    oam(0xf1, 0x0104),
    oam(0xf2, 0x0000),
    oam(0xf3, 0x0000),
    oam(0xc4, 0x093b), // agc
    oam(0xe9, 0x0040),
    oam(0xc6, 0xf3fc), // gpio
    oam(0xef, 0x0300),
    oam(0xfa, 0x0060),
    oam(0xdc, 0x0000),
    oam(0xda, 0x0001), // memory size
    oam(0x77, 0x0001),
    pp_data(0),
    pp_data(1),
];

pub const CLT_SCRIPT: &[Record] = &[
    ana(0x15, 0x0001),
    ana(0x08, PLL),
    ana(0x13, 0x5e60),
    oam(0xf9, 0x1800),
    oam(0xe1, TX_POWER),
    oam(0xf1, 0x0100),
    oam(0xd5, 0x0010), // max cnu
    oam(0xe9, 0x0050),
    oam(0xed, 0x00e8), // discovery
    oam(0xe2, 0x0001),
    oam(0xc4, 0x093b),
    oam(0xe2, 0x0001),
    oam(0xc6, 0x23fe),
    oam(0xef, 0x0300),
    oam(0xdd, 0xffd0), // priority queue shares
    oam(0xde, 0xcfc0),
    oam(0xdf, 0xbf00),
    oam(0xfa, 0x0060),
    oam(0xf2, 0x0000),
    oam(0x77, 0x0001),
    pp_data(0),
    pp_data(1),
];

pub fn script_for(kind: Kind) -> &'static [Record] {
    match kind {
        Kind::Cnu => CNU_SCRIPT,
        Kind::Clt => CLT_SCRIPT,
    }
}

pub fn encode_script(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in records {
        r.encode(&mut out);
    }
    out.push(END);
    out
}

pub fn decode_script(bytes: &[u8]) -> FirmwareResult<Vec<Record>> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let Some(&tag) = bytes.get(pos) else {
            return Err(FirmwareError::Format("script has no end marker".into()));
        };
        let take = move |n: usize| {
            bytes.get(pos + 1..pos + 1 + n).ok_or_else(|| {
                FirmwareError::Format(format!("script record at 0x{pos:x} truncated"))
            })
        };
        let (rec, len) = match (tag & KIND_MASK, tag & !KIND_MASK) {
            (END, 0) => return Ok(out),
            (ANA, 0) => {
                let b = take(3)?;
                (ana(b[0], u16::from_be_bytes([b[1], b[2]])), 3)
            }
            (OAM, 0) => {
                let b = take(4)?;
                let rec = Record::Oam {
                    llid: b[0],
                    reg: b[1],
                    value: u16::from_be_bytes([b[2], b[3]]),
                };
                (rec, 4)
            }
            (PP, timing) if timing == 0 || timing == TIME_STABLE => {
                let b = take(17)?;
                let mut data = [0u8; 6];
                let mut mask = [0u8; 6];
                data.copy_from_slice(&b[4..10]);
                mask.copy_from_slice(&b[10..16]);
                let rec = Record::Pp {
                    stable: timing == TIME_STABLE,
                    trx: b[0],
                    rule: b[1],
                    addr: b[2],
                    offset: b[3],
                    data,
                    mask,
                    ctr: b[16],
                };
                (rec, 17)
            }
            _ => {
                return Err(FirmwareError::Format(format!(
                    "unknown script tag 0x{tag:02x} at 0x{pos:x}"
                )));
            }
        };
        out.push(rec);
        pos += 1 + len;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetBand {
    pub reg: BandReg,
    pub range: BandRange,
    pub label: &'static str,
}

const fn band(
    a08: u16,
    a13: u16,
    packed: u16,
    low: u8,
    high: u8,
    label: &'static str,
) -> PresetBand {
    PresetBand {
        reg: BandReg::from_words(a08, a13, packed),
        range: BandRange { low, high },
        label,
    }
}

const EOC_FULL: PresetBand = band(0x29e3, 0x5e60, 0x1601, 11, 66, "[11MHz~66.4MHz]");
const EOC_HIGH: PresetBand = band(0x296b, 0x5f60, 0x2601, 42, 63, "[42MHz~63MHz]");
const EOC_WIDE: PresetBand = band(0x29c3, 0x5e60, 0x2401, 33, 87, "[33MHz~87MHz]");
const EOC_HIGH2: PresetBand = band(0xa96b, 0x5f60, 0x1a01, 34, 63, "[34MHz~63MHz]");
const EOC_TOP: PresetBand = band(0x2a33, 0x5ee0, 0x2201, 36, 100, "[36MHz~100MHz]");

const EOC_BANDS: &[PresetBand] = &[EOC_FULL, EOC_HIGH, EOC_WIDE, EOC_HIGH2, EOC_TOP];
const RF_BANDS: &[PresetBand] = &[
    band(0x2a13, 0x5f60, 0x2203, 57, 72, "[57MHz~72MHz]"),
    band(0x29a3, 0x5f60, 0x2203, 53, 65, "[53MHz~65MHz]"),
    EOC_HIGH2,
    EOC_WIDE,
    band(0x2a2b, 0x5e60, 0x2001, 32, 94, "[32MHz~94MHz]"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandPreset {
    Eoc,
    Rf,
}

impl BandPreset {
    pub const ALL: [BandPreset; 2] = [BandPreset::Eoc, BandPreset::Rf];

    pub fn name(self) -> &'static str {
        match self {
            BandPreset::Eoc => "eoc",
            BandPreset::Rf => "rf",
        }
    }

    pub fn bands(self) -> &'static [PresetBand] {
        match self {
            BandPreset::Eoc => EOC_BANDS,
            BandPreset::Rf => RF_BANDS,
        }
    }
}

impl FromStr for BandPreset {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eoc" => Ok(BandPreset::Eoc),
            "rf" | "eoc_rf" => Ok(BandPreset::Rf),
            _ => Err(()),
        }
    }
}

/// Hardware-support list appended when a save has no tail to keep.
pub fn support_hardware(kind: Kind) -> &'static str {
    match kind {
        Kind::Cnu => "CNU4009021B040010000000000000000",
        Kind::Clt => "CLT0208011A04001;0000000000000000",
    }
}

impl FirmwareImage {
    /// Write the boot script for this image's role, both band tables and the default
    /// soft mode id.
    pub fn apply_config(&mut self, preset: BandPreset) {
        let mut script = encode_script(script_for(self.kind()));
        script.resize(SCRIPT_LEN, 0xff);
        self.put(SCRIPT, &script);

        let bands = preset.bands();
        let mut regs = Vec::with_capacity(bands.len() * 6 + 2);
        let mut ranges = Vec::with_capacity(bands.len() * 2 + 3);
        ranges.extend_from_slice(&TUNER_ID.to_be_bytes());
        for b in bands {
            regs.extend_from_slice(&b.reg.encode());
            ranges.extend_from_slice(&[b.range.low, b.range.high]);
        }
        regs.extend_from_slice(&[0, 0]);
        ranges.push(0);
        self.put(REG_TABLE, &regs);
        self.put(RANGE_TABLE - 2, &ranges);
        self.put(SOFT_MODE_ID, DEFAULT_SOFT_MODE_ID.as_bytes());
        log::info!("[fw] applied {} config with {} bands", preset.name(), bands.len());
    }

    pub fn script(&self) -> FirmwareResult<Vec<Record>> {
        decode_script(self.get(SCRIPT, SCRIPT_LEN))
    }

    pub fn soft_mode_id(&self) -> String {
        self.get(SOFT_MODE_ID, DEFAULT_SOFT_MODE_ID.len())
            .iter()
            .map(|&b| b as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let bytes = encode_script(&[ana(0x08, 0x29e3), oam(0xe1, 0x1306), pp_data(1)]);
        assert_eq!(&bytes[..4], &[0x02, 0x08, 0x29, 0xe3]);
        assert_eq!(&bytes[4..9], &[0x01, 0x7e, 0xe1, 0x13, 0x06]);
        assert_eq!(bytes[9], 0x13);
        assert_eq!(&bytes[10..14], &[1, 0, 0, 8]);
        assert_eq!(&bytes[20..26], &[0xff; 6]);
        assert_eq!(bytes[26], 2);
        assert_eq!(bytes[27], 0);
        assert_eq!(bytes.len(), 4 + 5 + 18 + 1);
    }

    #[test]
    fn scripts_decode_back() {
        for kind in [Kind::Cnu, Kind::Clt] {
            let mut img = FirmwareImage::blank(kind);
            img.apply_config(BandPreset::Rf);
            assert_eq!(img.script().unwrap(), script_for(kind));
            assert_eq!(img.byte(0x6ff).unwrap(), 0xff);
        }
    }

    #[test]
    fn apply_writes_tables() {
        let mut img = FirmwareImage::blank(Kind::Clt);
        img.apply_config(BandPreset::Rf);
        assert_eq!(img.short(0x1e0).unwrap(), 0xfd83);
        assert_eq!(img.bytes(0x1e2, 2).unwrap(), &[57, 72]);
        assert_eq!(img.byte(0x1e2 + 10).unwrap(), 0);
        assert_eq!(img.short(0x60 + 30).unwrap(), 0);
        assert_eq!(img.soft_mode_id(), "000000000000");
        let bands = img.band_reg_list().unwrap();
        assert_eq!(bands[2], EOC_HIGH2.reg);
        assert_eq!(bands[0].a15, 0x03);
    }

    #[test]
    fn malformed_scripts() {
        assert!(decode_script(&[0x02, 0x08]).is_err());
        assert!(decode_script(&[0x07, 0, 0]).is_err());
        assert!(decode_script(&[0x02, 0x08, 0, 1]).is_err());
        assert_eq!(decode_script(&[0]).unwrap(), vec![]);
    }

    #[test]
    fn preset_names() {
        assert_eq!("RF".parse::<BandPreset>(), Ok(BandPreset::Rf));
        assert_eq!("eoc_rf".parse::<BandPreset>(), Ok(BandPreset::Rf));
        assert!("sec".parse::<BandPreset>().is_err());
        assert!(support_hardware(Kind::Clt).contains(';'));
    }
}
