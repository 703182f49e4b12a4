//! Palette Engine
//!
//! 256-entry RGB table with full (`NPAL`) and delta (`XPAL`) updates.
//! Changes are tracked as one inclusive dirty range that is handed to the
//! display on flush.

use thiserror::Error;

/// Bytes in a full palette (256 × RGB).
pub const PALETTE_BYTES: usize = 0x300;

/// Size of the XPAL form carrying deltas plus an absolute palette.
pub const XPAL_SET_SIZE: usize = PALETTE_BYTES * 3 + 4;

/// Size of the XPAL form that applies one step of the pending deltas.
pub const XPAL_APPLY_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum PaletteError {
    #[error("Palette payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Unsupported delta palette size: {0} bytes")]
    BadDeltaSize(usize),
}

/// Contiguous run of colours to upload to the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteUpdate {
    pub first: usize,
    /// RGB triples for entries `first..first + rgb.len() / 3`.
    pub rgb: Vec<u8>,
}

impl PaletteUpdate {
    pub fn count(&self) -> usize {
        self.rgb.len() / 3
    }
}

pub struct Palette {
    colors: [u8; PALETTE_BYTES],
    pending: [i16; PALETTE_BYTES],
    dirty: Option<(usize, usize)>,
}

impl Palette {
    pub fn new() -> Self {
        Self {
            colors: [0; PALETTE_BYTES],
            pending: [0; PALETTE_BYTES],
            dirty: None,
        }
    }

    pub fn colors(&self) -> &[u8; PALETTE_BYTES] {
        &self.colors
    }

    pub fn entry(&self, index: u8) -> [u8; 3] {
        let i = index as usize * 3;
        [self.colors[i], self.colors[i + 1], self.colors[i + 2]]
    }

    /// Full replacement; marks every entry dirty.
    pub fn set_full(&mut self, rgb: &[u8]) -> Result<(), PaletteError> {
        self.load_silent(rgb)?;
        self.mark_dirty(0, 255);
        Ok(())
    }

    /// Installs a palette without scheduling an upload.
    pub fn load_silent(&mut self, rgb: &[u8]) -> Result<(), PaletteError> {
        if rgb.len() < PALETTE_BYTES {
            return Err(PaletteError::TooShort(rgb.len()));
        }
        self.colors.copy_from_slice(&rgb[..PALETTE_BYTES]);
        Ok(())
    }

    /// Handles an XPAL payload in either of its two shapes.
    pub fn apply_xpal(&mut self, payload: &[u8]) -> Result<(), PaletteError> {
        match payload.len() {
            XPAL_SET_SIZE => {
                let deltas = &payload[4..4 + PALETTE_BYTES * 2];
                for (slot, raw) in self.pending.iter_mut().zip(deltas.chunks_exact(2)) {
                    *slot = i16::from_le_bytes([raw[0], raw[1]]);
                }
                self.set_full(&payload[4 + PALETTE_BYTES * 2..])
            }
            XPAL_APPLY_SIZE => {
                self.step_deltas();
                Ok(())
            }
            other => Err(PaletteError::BadDeltaSize(other)),
        }
    }

    /// Moves every component halfway along its remaining delta.
    ///
    /// Halving rounds away from zero, so a delta never stalls short of its
    /// target: any delta in -255..=255 is within 1 of the target after at
    /// most log2(256) + 2 = 10 applies. Fades are built on that bound.
    pub fn step_deltas(&mut self) {
        for (color, pending) in self.colors.iter_mut().zip(self.pending.iter_mut()) {
            let step = halve_away_from_zero(*pending);
            *color = (i32::from(*color) + i32::from(step)).clamp(0, 255) as u8;
            *pending -= step;
        }
        self.mark_dirty(0, 255);
    }

    /// Grows the dirty range to cover `min..=max`.
    pub fn mark_dirty(&mut self, min: usize, max: usize) {
        let (min, max) = (min.min(255), max.min(255));
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    /// Returns the dirty sub-range and resets tracking.
    pub fn take_dirty(&mut self) -> Option<PaletteUpdate> {
        let (lo, hi) = self.dirty.take()?;
        Some(PaletteUpdate {
            first: lo,
            rgb: self.colors[lo * 3..(hi + 1) * 3].to_vec(),
        })
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new()
    }
}

fn halve_away_from_zero(value: i16) -> i16 {
    let v = i32::from(value);
    ((v + v.signum()) / 2) as i16
}
