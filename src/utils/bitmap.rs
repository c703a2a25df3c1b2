//! Bitmap data structure helper, used for quorum bookkeeping.

use std::fmt;

use crate::utils::SynleaseError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u8 ID -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new all-false bitmap of given size.
    pub fn new(size: u8) -> Result<Self, SynleaseError> {
        if size == 0 {
            return Err(SynleaseError::msg("invalid bitmap size 0"));
        }
        Ok(Bitmap(FixedBitSet::with_capacity(size as usize)))
    }

    /// Sets bit at index. Returns the previous flag.
    #[inline]
    pub fn set(&mut self, idx: u8) -> Result<bool, SynleaseError> {
        if idx as usize >= self.0.len() {
            return Err(SynleaseError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(self.0.put(idx as usize))
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, SynleaseError> {
        if idx as usize >= self.0.len() {
            return Err(SynleaseError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Iterates over indices whose bit is set.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|i| i as u8)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ones: Vec<u8> = self.ones().collect();
        write!(f, "{{{}; {:?}}}", self.size(), ones)
    }
}
