//! Band tables.
//!
//! Two tables share one band index. The register table at 0x60 holds three big-endian
//! words per band (ANA 0x08, ANA 0x13, then OAM 0xf9's high byte over ANA 0x15's low
//! byte) and ends with a zero word. The range table at 0x1e2 holds a low/high MHz byte
//! pair per band and ends with a zero byte. A CLT keeps a second copy of both inside its
//! embedded CNU image.

use super::{EMBEDDED_CNU, FirmwareError, FirmwareImage, FirmwareResult, Kind};

/// Bands a table can hold.
pub const BAND_SLOTS: usize = 5;

pub(crate) const REG_TABLE: usize = 0x60;
const REG_WORDS: usize = 3;
/// Range table, after the two-byte tuner id.
pub(crate) const RANGE_TABLE: usize = 0x1e2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandReg {
    pub a08: u16,
    pub a13: u16,
    pub a15: u16,
    pub of9: u16,
}

impl BandReg {
    pub const fn new(a08: u16, a13: u16, a15: u16, of9: u16) -> Self {
        Self { a08, a13, a15, of9 }
    }

    /// From the three stored words.
    pub const fn from_words(a08: u16, a13: u16, packed: u16) -> Self {
        Self {
            a08,
            a13,
            a15: packed & 0x00ff,
            of9: packed & 0xff00,
        }
    }

    pub const fn packed(&self) -> u16 {
        (self.of9 & 0xff00) | (self.a15 & 0x00ff)
    }

    pub(crate) fn encode(&self) -> [u8; REG_WORDS * 2] {
        let mut out = [0u8; REG_WORDS * 2];
        for (i, w) in [self.a08, self.a13, self.packed()].into_iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&w.to_be_bytes());
        }
        out
    }
}

/// Band edges in MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandRange {
    pub low: u8,
    pub high: u8,
}

impl FirmwareImage {
    /// Decode the register table.
    ///
    /// Fails with [`FirmwareError::BandAna15Unsupported`] on images whose third column
    /// carries no ANA 0x15 value; band editing should be turned off for those.
    pub fn band_reg_list(&self) -> FirmwareResult<Vec<BandReg>> {
        let mut words = Vec::new();
        for slot in 0..=BAND_SLOTS * REG_WORDS {
            let w = self.get_short(REG_TABLE + slot * 2);
            if w == 0 {
                break;
            }
            words.push(w);
        }
        if words.len() % REG_WORDS != 0 {
            log::warn!("[fw] band table holds {} words", words.len());
            return Err(FirmwareError::BandSize(words.len()));
        }

        let bands: Vec<BandReg> = words
            .chunks_exact(REG_WORDS)
            .map(|w| BandReg::from_words(w[0], w[1], w[2]))
            .collect();
        if bands.iter().any(|b| b.a15 == 0) {
            return Err(FirmwareError::BandAna15Unsupported);
        }
        Ok(bands)
    }

    pub fn set_band_reg(&mut self, index: usize, band: BandReg) -> FirmwareResult<()> {
        check_index(index)?;
        let at = REG_TABLE + index * REG_WORDS * 2;
        self.put_band(at, &band.encode());
        Ok(())
    }

    pub fn band_range_list(&self) -> FirmwareResult<Vec<BandRange>> {
        let mut bytes = Vec::new();
        for &b in self.get(RANGE_TABLE, BAND_SLOTS * 2 + 1) {
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        if bytes.len() % 2 != 0 {
            log::warn!("[fw] range table holds {} bytes", bytes.len());
            return Err(FirmwareError::BandSize(bytes.len()));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|p| BandRange {
                low: p[0],
                high: p[1],
            })
            .collect())
    }

    pub fn set_band_range(&mut self, index: usize, range: BandRange) -> FirmwareResult<()> {
        check_index(index)?;
        self.put_band(RANGE_TABLE + index * 2, &[range.low, range.high]);
        Ok(())
    }

    /// Write at `at` and, on a CLT, into the embedded CNU image too.
    fn put_band(&mut self, at: usize, data: &[u8]) {
        self.put(at, data);
        if self.kind() == Kind::Clt {
            self.put(at + EMBEDDED_CNU, data);
            self.embedded_checksum();
        }
    }
}

fn check_index(index: usize) -> FirmwareResult<()> {
    if index >= BAND_SLOTS {
        return Err(FirmwareError::BandIndex {
            index,
            max: BAND_SLOTS,
        });
    }
    Ok(())
}
