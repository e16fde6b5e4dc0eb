//! 07.10 frame check sequence.
//!
//! CRC-8 with the reversed polynomial x^8 + x^2 + x + 1 (0xE0), initial value
//! 0xFF, transmitted as the ones' complement of the register.

/// Remainder left in the register after running a valid frame through the
/// CRC including its FCS octet.
pub const GOOD_FCS: u8 = 0xCF;

const FCS_INIT: u8 = 0xFF;

static CRC_TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn update(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc = CRC_TABLE[(crc ^ byte) as usize];
    }
    crc
}

/// Compute the FCS octet for `data`.
pub fn compute(data: &[u8]) -> u8 {
    0xFF - update(FCS_INIT, data)
}

/// Check a received FCS octet against `data`.
pub fn verify(data: &[u8], received: u8) -> bool {
    update(update(FCS_INIT, data), &[received]) == GOOD_FCS
}

/// Incremental FCS over non-contiguous slices.
#[derive(Debug, Clone, Copy)]
pub struct Fcs(u8);

impl Default for Fcs {
    fn default() -> Self {
        Self(FCS_INIT)
    }
}

impl Fcs {
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0 = update(self.0, data);
        self
    }

    pub fn finish(&self) -> u8 {
        0xFF - self.0
    }

    pub fn matches(&self, received: u8) -> bool {
        update(self.0, &[received]) == GOOD_FCS
    }
}
