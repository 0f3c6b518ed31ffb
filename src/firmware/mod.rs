//! Flash image codec for CNU and CLT firmware files.
//!
//! A file carries one 0x20000-byte active region at offset 0x20000. Everything before it
//! (the head) and after the body (the tail) is kept verbatim from the loaded file so an
//! untouched image saves back byte for byte.
//!
//! File layout:
//!
//! ```text
//! CNU  0x00000 head: two 0x10000 blocks, each starting with a CNU id record
//!      0x20000 body: active[..0x10000] written twice
//!      0x40000 tail: hardware-support list
//! CLT  0x00000 head: 0x20000 bytes (0xFF when generated)
//!      0x20000 body: active region repeated, cut at 0x90000
//!      0x90000 tail: hardware-support list
//! ```

pub mod band;
pub mod cfg;
pub mod fields;

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

use crate::transport::MacAddr;

pub use band::{BAND_SLOTS, BandRange, BandReg};
pub use cfg::{BandPreset, Record};
pub use fields::{FLAGS, Flag};

/// Length of the active region.
pub const REGION_LEN: usize = 0x20000;
/// Offset of the active region inside a file.
pub const REGION_OFFSET: usize = 0x20000;
/// Bytes covered by the checksum word at offset 0.
pub const CHECKSUM_SPAN: usize = 0x10000;
/// Embedded CNU image inside a CLT region.
pub const EMBEDDED_CNU: usize = 0x18000;
const EMBEDDED_LEN: usize = 0x8000;

const CNU_MIN_FILE: usize = 0x40000;
const CNU_MAX_FILE: usize = 0x50000;
const CLT_BODY_END: usize = 0x90000;
const CNU_BLOCK: usize = 0x10000;
const FACTORY_INFO: Range<usize> = 0x80120..0x80200;

pub const CNU_ID_MARKER: u8 = 0x87;

const ROM_TABLE: usize = 0x400;
const ROM_TABLE_LEN: usize = 0x100;
const ROM_ENTRY: usize = 0x10;

const FW_DESC: usize = 0x100;
const FW_MAIN: usize = 0x1000;
const FW_MAIN_LOAD: u32 = 0x0100_a000;
const FW_EXT: usize = 0x16000 - 0x380;
const FW_EXT_LOAD: u32 = 0x0100_44fc - 0x380;
const FILE_SYSTEM: usize = 0x8000;
const FILE_SYSTEM_LEN: usize = FW_EXT - FILE_SYSTEM;

const HTTP_HEADER: usize = 0x200;
const HTTP_HEADER_TEMPLATE: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/html\r\n\
Content-length: XXXXX\r\n\
Content-Encoding:     \r\n\
Cache-Control: private \r\n\
Set-Cookie: W=01:XX\r\n\
\r\n";

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("not a firmware image: {0}")]
    Format(String),
    #[error("band table has no ANA 0x15 column (older layout)")]
    BandAna15Unsupported,
    #[error("band table holds {0} entries, not a whole number of bands")]
    BandSize(usize),
    #[error("band index {index} out of range, {max} slots")]
    BandIndex { index: usize, max: usize },
    #[error("0x{len:x} bytes at 0x{offset:x} fall outside the image")]
    FieldRange { offset: usize, len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FirmwareResult<T> = Result<T, FirmwareError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Cnu,
    Clt,
}

impl Kind {
    /// Shape of a file, from its length alone.
    pub fn classify(len: usize) -> FirmwareResult<Kind> {
        if len < CNU_MIN_FILE {
            Err(FirmwareError::Format(format!("0x{len:x} bytes is too short")))
        } else if len < CNU_MAX_FILE {
            Ok(Kind::Cnu)
        } else if len > CLT_BODY_END {
            Ok(Kind::Clt)
        } else {
            Err(FirmwareError::Format(format!(
                "0x{len:x} bytes is neither a CNU nor a CLT image"
            )))
        }
    }

    fn tail_offset(self) -> usize {
        match self {
            Kind::Cnu => CNU_MIN_FILE,
            Kind::Clt => CLT_BODY_END,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Cnu => "cnu",
            Kind::Clt => "clt",
        })
    }
}

impl FromStr for Kind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cnu" => Ok(Kind::Cnu),
            "clt" => Ok(Kind::Clt),
            _ => Err(()),
        }
    }
}

/// CLT calibration block captured from the loaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo(Vec<u8>);

impl FactoryInfo {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
    pub fn tx_correction(&self) -> u8 {
        self.0[0xbd]
    }
    pub fn rx_correction(&self) -> u8 {
        self.0[0xbe]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    pub kind: Kind,
    pub preserve_head: bool,
    pub preserve_tail: bool,
}

impl SaveOptions {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            preserve_head: true,
            preserve_tail: true,
        }
    }
}

#[derive(Clone)]
pub struct FirmwareImage {
    buf: Vec<u8>,
    kind: Kind,
    dirty: bool,
    original: Option<Vec<u8>>,
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("kind", &self.kind)
            .field("dirty", &self.dirty)
            .field("loaded", &self.original.as_ref().map(Vec::len))
            .finish()
    }
}

impl FirmwareImage {
    /// Erased region with a zero checksum word.
    pub fn blank(kind: Kind) -> Self {
        let mut buf = vec![0xff; REGION_LEN];
        buf[..4].fill(0);
        Self {
            buf,
            kind,
            dirty: false,
            original: None,
        }
    }

    pub fn from_bytes(file: &[u8]) -> FirmwareResult<Self> {
        let kind = Kind::classify(file.len())?;
        Ok(Self {
            buf: file[REGION_OFFSET..REGION_OFFSET + REGION_LEN].to_vec(),
            kind,
            dirty: false,
            original: Some(file.to_vec()),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> FirmwareResult<Self> {
        let path = path.as_ref();
        let file = fs::read(path)?;
        let img = Self::from_bytes(&file)?;
        log::info!(
            "[fw] loaded {} image {} (0x{:x} bytes)",
            img.kind,
            path.display(),
            file.len()
        );
        Ok(img)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Whether any byte of the region changed since load.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// First id record of the loaded head.
    pub fn head_record(&self) -> Option<&[u8]> {
        self.original.as_deref().map(|f| &f[..8])
    }

    /// Device id carried by the loaded head, for either shape.
    pub fn cnu_id(&self) -> Option<MacAddr> {
        let rec = self.head_record()?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&rec[..6]);
        Some(MacAddr(mac))
    }

    pub fn factory_info(&self) -> Option<FactoryInfo> {
        if self.kind != Kind::Clt {
            return None;
        }
        let file = self.original.as_deref()?;
        file.get(FACTORY_INFO).map(|b| FactoryInfo(b.to_vec()))
    }

    fn head(&self) -> Option<&[u8]> {
        self.original.as_deref().map(|f| &f[..REGION_OFFSET])
    }

    fn tail(&self) -> Option<&[u8]> {
        let file = self.original.as_deref()?;
        file.get(self.kind.tail_offset()..).filter(|t| !t.is_empty())
    }

    /* ---------- raw access ---------- */

    fn span(&self, offset: usize, len: usize) -> FirmwareResult<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= REGION_LEN => Ok(offset..end),
            _ => Err(FirmwareError::FieldRange { offset, len }),
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> FirmwareResult<&[u8]> {
        let r = self.span(offset, len)?;
        Ok(&self.buf[r])
    }

    pub fn set_bytes(&mut self, offset: usize, data: &[u8]) -> FirmwareResult<()> {
        self.span(offset, data.len())?;
        self.put(offset, data);
        Ok(())
    }

    pub fn byte(&self, offset: usize) -> FirmwareResult<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn set_byte(&mut self, offset: usize, v: u8) -> FirmwareResult<()> {
        self.set_bytes(offset, &[v])
    }

    pub fn short(&self, offset: usize) -> FirmwareResult<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn set_short(&mut self, offset: usize, v: u16) -> FirmwareResult<()> {
        self.set_bytes(offset, &v.to_be_bytes())
    }

    pub fn word(&self, offset: usize) -> FirmwareResult<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn set_word(&mut self, offset: usize, v: u32) -> FirmwareResult<()> {
        self.set_bytes(offset, &v.to_be_bytes())
    }

    /// Bytes read as Latin-1 text.
    pub fn string(&self, offset: usize, len: usize) -> FirmwareResult<String> {
        Ok(self.bytes(offset, len)?.iter().map(|&b| b as char).collect())
    }

    pub fn set_string(&mut self, offset: usize, s: &str) -> FirmwareResult<()> {
        self.set_bytes(offset, s.as_bytes())
    }

    /// Fill with 0xFF.
    pub fn erase(&mut self, offset: usize, len: usize) -> FirmwareResult<()> {
        self.span(offset, len)?;
        self.put(offset, &vec![0xff; len]);
        Ok(())
    }

    /// Unchecked write for the fixed offsets in this module. Marks the image dirty only
    /// when a byte actually changes.
    pub(crate) fn put(&mut self, offset: usize, data: &[u8]) {
        let dst = &mut self.buf[offset..offset + data.len()];
        if *dst != *data {
            dst.copy_from_slice(data);
            self.dirty = true;
        }
    }

    pub(crate) fn get(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }

    pub(crate) fn get_short(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    /* ---------- checksums ---------- */

    /// Recompute the checksum word so the first 0x10000 bytes sum to zero.
    pub fn checksum(&mut self) -> u32 {
        self.put(0, &[0; 4]);
        let csum = word_sum(&self.buf[..CHECKSUM_SPAN]).wrapping_neg();
        self.put(0, &csum.to_be_bytes());
        log::debug!("[fw] checksum 0x{:08x}", csum);
        csum
    }

    pub fn checksum_ok(&self) -> bool {
        word_sum(&self.buf[..CHECKSUM_SPAN]) == 0
    }

    /// Checksum of the CLT's embedded CNU image. Only its first 0x8000 bytes are
    /// stored; the rest counts as erased flash.
    pub fn embedded_checksum(&mut self) -> u32 {
        self.put(EMBEDDED_CNU, &[0; 4]);
        let csum = self.embedded_sum().wrapping_neg();
        self.put(EMBEDDED_CNU, &csum.to_be_bytes());
        csum
    }

    pub fn embedded_checksum_ok(&self) -> bool {
        self.embedded_sum() == 0
    }

    fn embedded_sum(&self) -> u32 {
        let pad_words = ((CNU_BLOCK - EMBEDDED_LEN) / 4) as u32;
        word_sum(&self.buf[EMBEDDED_CNU..EMBEDDED_CNU + EMBEDDED_LEN])
            .wrapping_add(pad_words.wrapping_mul(0xffff_ffff))
    }

    /* ---------- payload placement ---------- */

    /// Copy the first 0x8000 bytes of a CNU file's active region into the CLT region.
    pub fn attach_cnu_firmware(&mut self, cnu_file: &[u8]) -> FirmwareResult<()> {
        let src = cnu_file
            .get(REGION_OFFSET..REGION_OFFSET + EMBEDDED_LEN)
            .ok_or_else(|| FirmwareError::Format("CNU file too short to attach".into()))?;
        self.erase(EMBEDDED_CNU, REGION_LEN - EMBEDDED_CNU)?;
        self.put(EMBEDDED_CNU, src);
        Ok(())
    }

    /// Place the main firmware and its extension and fill in their descriptors.
    pub fn place_firmware(&mut self, main: &[u8], ext: &[u8]) -> FirmwareResult<()> {
        if FW_MAIN + main.len() > FILE_SYSTEM {
            return Err(FirmwareError::FieldRange {
                offset: FW_MAIN,
                len: main.len(),
            });
        }
        if FW_EXT + ext.len() > EMBEDDED_CNU {
            return Err(FirmwareError::FieldRange {
                offset: FW_EXT,
                len: ext.len(),
            });
        }
        self.erase(FW_DESC, 0x20)?;
        self.put(FW_MAIN, main);
        self.put(FW_DESC, &(main.len() as u32).to_be_bytes());
        self.put(FW_DESC + 4, &FW_MAIN_LOAD.to_be_bytes());
        self.put(FW_DESC + 8, &(FW_MAIN as u32).to_be_bytes());

        self.put(FW_EXT, ext);
        self.put(FW_DESC + 0x10, &(ext.len() as u32).to_be_bytes());
        self.put(FW_DESC + 0x14, &FW_EXT_LOAD.to_be_bytes());
        self.put(FW_DESC + 0x18, &(FW_EXT as u32).to_be_bytes());
        Ok(())
    }

    pub fn set_file_system(&mut self, fs_image: &[u8]) -> FirmwareResult<()> {
        if fs_image.len() > FILE_SYSTEM_LEN {
            return Err(FirmwareError::FieldRange {
                offset: FILE_SYSTEM,
                len: fs_image.len(),
            });
        }
        self.erase(FILE_SYSTEM, FILE_SYSTEM_LEN)?;
        self.put(FILE_SYSTEM, fs_image);
        Ok(())
    }

    /// ROM patch table: up to 16 `(compare, replace)` address pairs.
    pub fn set_rom_replacements(&mut self, pairs: &[(u32, u32)]) -> FirmwareResult<()> {
        if pairs.len() * ROM_ENTRY > ROM_TABLE_LEN {
            return Err(FirmwareError::FieldRange {
                offset: ROM_TABLE,
                len: pairs.len() * ROM_ENTRY,
            });
        }
        self.erase(ROM_TABLE, ROM_TABLE_LEN)?;
        for (i, &(cmp, rep)) in pairs.iter().enumerate() {
            let at = ROM_TABLE + i * ROM_ENTRY;
            self.put(at, &1u32.to_be_bytes());
            self.put(at + 4, &cmp.to_be_bytes());
            self.put(at + 8, &rep.to_be_bytes());
        }
        Ok(())
    }

    pub fn set_http_header_template(&mut self) {
        self.put(HTTP_HEADER, HTTP_HEADER_TEMPLATE.as_bytes());
    }

    /// Over-the-air update lines: `oooo:<64 bytes hex>:00aa` for each non-erased 64-byte
    /// block of the first 0x8000 bytes.
    pub fn cnu_update_lines(&self) -> String {
        let mut out = String::new();
        for (i, block) in self.buf[..CHECKSUM_SPAN / 2].chunks(64).enumerate() {
            if block.iter().all(|&b| b == 0xff) {
                continue;
            }
            out.push_str(&format!("{:04x}:", i * 64));
            for b in block {
                out.push_str(&format!("{:02x}", b));
            }
            out.push_str(":00aa\n");
        }
        out
    }

    /* ---------- save ---------- */

    pub fn to_bytes(&self, opts: &SaveOptions) -> Vec<u8> {
        self.to_bytes_with(opts, &mut rand::thread_rng())
    }

    /// Region as it goes to disk, with the checksum word brought up to date.
    fn sealed_region(&self) -> Cow<'_, [u8]> {
        if self.checksum_ok() {
            return Cow::Borrowed(&self.buf);
        }
        let mut buf = self.buf.clone();
        buf[..4].fill(0);
        let csum = word_sum(&buf[..CHECKSUM_SPAN]).wrapping_neg();
        buf[..4].copy_from_slice(&csum.to_be_bytes());
        log::debug!("[fw] checksum refreshed on save: 0x{:08x}", csum);
        Cow::Owned(buf)
    }

    /// Assemble the file. `rng` supplies device ids for a generated CNU head.
    ///
    /// An untouched loaded image comes back verbatim. Anything else gets a valid
    /// checksum word in the written copy.
    pub fn to_bytes_with<R: Rng + ?Sized>(&self, opts: &SaveOptions, rng: &mut R) -> Vec<u8> {
        if let Some(orig) = &self.original
            && !self.dirty
            && opts.preserve_head
            && opts.preserve_tail
            && opts.kind == self.kind
        {
            return orig.clone();
        }

        let region = self.sealed_region();
        let mut out = Vec::with_capacity(CLT_BODY_END + 0x100);
        match (opts.preserve_head, self.head()) {
            (true, Some(head)) => out.extend_from_slice(head),
            _ => match opts.kind {
                Kind::Cnu => {
                    for _ in 0..2 {
                        let mut mac = [0u8; 6];
                        rng.fill(&mut mac);
                        out.extend_from_slice(&encode_cnu_id(MacAddr(mac)));
                        out.resize(out.len() + CNU_BLOCK - 8, 0xff);
                    }
                }
                Kind::Clt => out.resize(REGION_OFFSET, 0xff),
            },
        }

        match opts.kind {
            Kind::Cnu => {
                for _ in 0..2 {
                    out.extend_from_slice(&region[..CNU_BLOCK]);
                }
            }
            Kind::Clt => {
                while out.len() < CLT_BODY_END {
                    out.extend_from_slice(&region);
                }
                out.truncate(CLT_BODY_END);
            }
        }

        match self.tail().filter(|_| opts.preserve_tail) {
            Some(tail) => out.extend_from_slice(tail),
            None => out.extend_from_slice(cfg::support_hardware(opts.kind).as_bytes()),
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>, opts: &SaveOptions) -> FirmwareResult<()> {
        let path = path.as_ref();
        let data = self.to_bytes(opts);
        fs::write(path, &data)?;
        log::info!(
            "[fw] saved {} image {} (0x{:x} bytes)",
            opts.kind,
            path.display(),
            data.len()
        );
        Ok(())
    }
}

/// Wrapping sum of big-endian words.
pub fn word_sum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]])))
}

/// Id record at the start of each CNU head block: MAC, marker, then a byte that brings the
/// record's sum to zero.
pub fn encode_cnu_id(mac: MacAddr) -> [u8; 8] {
    let mut rec = [0u8; 8];
    rec[..6].copy_from_slice(&mac.octets());
    rec[6] = CNU_ID_MARKER;
    let sum = rec[..7].iter().fold(0u8, |a, &b| a.wrapping_add(b));
    rec[7] = sum.wrapping_neg();
    rec
}

pub fn check_cnu_id(rec: &[u8]) -> bool {
    rec.len() >= 8
        && rec[6] == CNU_ID_MARKER
        && rec[..8].iter().fold(0u8, |a, &b| a.wrapping_add(b)) == 0
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn generated(kind: Kind) -> Vec<u8> {
        let mut img = FirmwareImage::blank(kind);
        img.set_string(0x840, "bench unit").unwrap();
        img.checksum();
        img.to_bytes_with(&SaveOptions::new(kind), &mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn classify_by_length() {
        assert_eq!(Kind::classify(0x40000).unwrap(), Kind::Cnu);
        assert_eq!(Kind::classify(0x4ffff).unwrap(), Kind::Cnu);
        assert_eq!(Kind::classify(0x98000).unwrap(), Kind::Clt);
        for len in [0x30000, 0x50000, 0x90000] {
            assert!(matches!(Kind::classify(len), Err(FirmwareError::Format(_))));
        }
        assert!(FirmwareImage::from_bytes(&vec![0xff; 0x98000]).is_ok());
        assert!(FirmwareImage::from_bytes(&vec![0xff; 0x30000]).is_err());
    }

    #[test]
    fn generated_shapes() {
        let cnu = generated(Kind::Cnu);
        assert_eq!(cnu.len(), 0x40000 + "CNU4009021B040010000000000000000".len());
        assert!(check_cnu_id(&cnu[..8]));
        assert!(check_cnu_id(&cnu[0x10000..0x10008]));
        assert_eq!(&cnu[0x20000..0x30000], &cnu[0x30000..0x40000]);
        assert!(cnu.ends_with(b"CNU4009021B040010000000000000000"));

        let clt = generated(Kind::Clt);
        assert_eq!(clt.len(), 0x90000 + "CLT0208011A04001;0000000000000000".len());
        assert!(clt[..0x20000].iter().all(|&b| b == 0xff));
        assert_eq!(&clt[0x20000..0x40000], &clt[0x60000..0x80000]);
    }

    #[test]
    fn load_then_save_is_identical() {
        for kind in [Kind::Cnu, Kind::Clt] {
            let file = generated(kind);
            let img = FirmwareImage::from_bytes(&file).unwrap();
            assert_eq!(img.kind(), kind);
            assert!(!img.is_dirty());
            assert_eq!(img.to_bytes(&SaveOptions::new(kind)), file);
        }
    }

    #[test]
    fn edit_and_revert_still_identical() {
        for kind in [Kind::Cnu, Kind::Clt] {
            let file = generated(kind);
            let mut img = FirmwareImage::from_bytes(&file).unwrap();
            img.set_byte(0x764, 3).unwrap();
            img.set_byte(0x764, 0xff).unwrap();
            assert!(img.is_dirty());
            assert_eq!(img.to_bytes(&SaveOptions::new(kind)), file);
        }
    }

    #[test]
    fn unrelated_file_round_trips_through_disk() {
        let mut file: Vec<u8> = (0..0x98000u32).map(|i| (i * 7 + i / 251) as u8).collect();
        file[0x80120 + 0xbd] = 0x12;
        file[0x80120 + 0xbe] = 0x34;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clt.bin");
        let dst = dir.path().join("out.bin");
        fs::write(&src, &file).unwrap();

        let mut img = FirmwareImage::load(&src).unwrap();
        assert_eq!(img.kind(), Kind::Clt);
        let info = img.factory_info().unwrap();
        assert_eq!((info.tx_correction(), info.rx_correction()), (0x12, 0x34));
        img.save(&dst, &SaveOptions::new(Kind::Clt)).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), file);

        img.checksum();
        assert!(img.checksum_ok());
        assert!(img.is_dirty());
        let out = img.to_bytes(&SaveOptions::new(Kind::Clt));
        assert_eq!(out.len(), file.len());
        assert_eq!(&out[..0x20000], &file[..0x20000]);
        assert_eq!(&out[0x90000..], &file[0x90000..]);
    }

    #[test]
    fn save_writes_a_fresh_checksum() {
        for kind in [Kind::Cnu, Kind::Clt] {
            let file = generated(kind);
            let mut img = FirmwareImage::from_bytes(&file).unwrap();
            img.set_string(0x840, "field unit").unwrap();
            assert!(!img.checksum_ok());

            let out = img.to_bytes(&SaveOptions::new(kind));
            let reloaded = FirmwareImage::from_bytes(&out).unwrap();
            assert!(reloaded.checksum_ok());
            assert_eq!(reloaded.string(0x840, 10).unwrap(), "field unit");
            // the in-memory image is left as it was
            assert!(!img.checksum_ok());
        }
    }

    #[test]
    fn checksum_zeroes_the_sum() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        img.set_word(0x100, 0x1234_5678).unwrap();
        img.set_string(0x840, "x").unwrap();
        let c = img.checksum();
        assert_eq!(img.word(0).unwrap(), c);
        assert!(img.checksum_ok());
        assert_eq!(word_sum(&img.as_bytes()[..CHECKSUM_SPAN]), 0);
    }

    #[test]
    fn embedded_checksum_counts_erased_tail() {
        let mut img = FirmwareImage::blank(Kind::Clt);
        let mut cnu = generated(Kind::Cnu);
        cnu[0x20010] = 0x42;
        img.attach_cnu_firmware(&cnu).unwrap();
        assert_eq!(img.byte(EMBEDDED_CNU + 0x10).unwrap(), 0x42);
        img.embedded_checksum();
        assert!(img.embedded_checksum_ok());
        assert!(img.attach_cnu_firmware(&cnu[..0x21000]).is_err());
    }

    #[test]
    fn accessors_are_bounds_checked() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        assert!(matches!(
            img.set_word(REGION_LEN - 2, 0),
            Err(FirmwareError::FieldRange { .. })
        ));
        assert!(img.short(usize::MAX).is_err());
        assert!(!img.is_dirty());
        img.set_short(0x10, 0xabcd).unwrap();
        assert_eq!(img.byte(0x10).unwrap(), 0xab);
        assert_eq!(img.string(0x10, 1).unwrap(), "\u{ab}");
    }

    #[test]
    fn cnu_id_record() {
        let mac: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        let rec = encode_cnu_id(mac);
        assert_eq!(rec[6], 0x87);
        assert!(check_cnu_id(&rec));
        let mut bad = rec;
        bad[7] ^= 1;
        assert!(!check_cnu_id(&bad));

        let file = generated(Kind::Cnu);
        let img = FirmwareImage::from_bytes(&file).unwrap();
        assert_eq!(img.cnu_id().unwrap().octets()[..], file[..6]);
    }

    #[test]
    fn payload_placement() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        img.place_firmware(&[1, 2, 3, 4, 5], &[9; 8]).unwrap();
        assert_eq!(img.word(0x100).unwrap(), 5);
        assert_eq!(img.word(0x104).unwrap(), 0x0100_a000);
        assert_eq!(img.word(0x108).unwrap(), 0x1000);
        assert_eq!(img.word(0x118).unwrap(), 0x15c80);
        assert_eq!(img.bytes(0x15c80, 8).unwrap(), &[9; 8]);
        assert!(img.place_firmware(&vec![0; 0x8000], &[]).is_err());

        img.set_rom_replacements(&[(0x10, 0x20)]).unwrap();
        assert_eq!(img.word(0x400).unwrap(), 1);
        assert_eq!(img.word(0x408).unwrap(), 0x20);
        assert_eq!(img.word(0x410).unwrap(), 0xffff_ffff);

        let lines = img.cnu_update_lines();
        assert!(lines.lines().any(|l| l.starts_with("0100:00000005")));
        assert!(lines.lines().all(|l| l.ends_with(":00aa")));
    }
}
