//! Cached min/max and histogram over a Grey pixel set.

use crate::error::Result;
use crate::format::{HISTOGRAM_LEN, MAX_GREY, MIN_GREY};

/// Pixels fetched per read while scanning.
pub const SCAN_BATCH: usize = 4096;

/// Flat read access to Grey pixels, indexed over the whole image.
pub trait GreySource {
    fn pixel_count(&self) -> u64;

    /// Fill `out` with pixels `first .. first + out.len()`.
    fn read_grey(&mut self, first: u64, out: &mut [i16]) -> Result<()>;
}

/// Which cached statistic to ask about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    MaxMin,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub(crate) max_min_valid: bool,
    pub(crate) min: i32,
    pub(crate) max: i32,
    pub(crate) histogram_valid: bool,
    pub(crate) histogram: Vec<i32>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Empty bound (min above max) and nothing cached.
    pub fn new() -> Self {
        Self {
            max_min_valid: false,
            min: MAX_GREY,
            max: MIN_GREY,
            histogram_valid: false,
            histogram: vec![0; HISTOGRAM_LEN],
        }
    }

    pub fn is_valid(&self, kind: StatKind) -> bool {
        match kind {
            StatKind::MaxMin => self.max_min_valid,
            StatKind::Histogram => self.histogram_valid,
        }
    }

    /// Cached `(min, max)` pair regardless of validity.
    pub fn bounds(&self) -> (i32, i32) {
        (self.min, self.max)
    }

    pub fn invalidate(&mut self) {
        self.max_min_valid = false;
        self.histogram_valid = false;
    }

    /// Widen the cached bound with freshly written pixels.
    ///
    /// This only ever pushes the bound outward, so it can stay looser than
    /// the true range; [`Statistics::max_min`] rescans for the exact values.
    pub fn observe_written(&mut self, pixels: impl IntoIterator<Item = i16>) {
        for p in pixels {
            let p = i32::from(p);
            if p > self.max {
                self.max = p;
            }
            if p < self.min {
                self.min = p;
            }
        }
    }

    /// Exact `(min, max)`, scanning only when the cache is stale.
    pub fn max_min<S: GreySource>(&mut self, source: &mut S) -> Result<(i32, i32)> {
        if self.max_min_valid {
            return Ok((self.min, self.max));
        }

        let mut min = MAX_GREY;
        let mut max = MIN_GREY;
        scan(source, |p| {
            let p = i32::from(p);
            min = min.min(p);
            max = max.max(p);
        })?;

        self.min = min;
        self.max = max;
        self.max_min_valid = true;
        Ok((min, max))
    }

    /// Histogram of `value - min`; values past the last bucket pile into it.
    pub fn histogram<S: GreySource>(&mut self, source: &mut S) -> Result<&[i32]> {
        if self.histogram_valid {
            return Ok(&self.histogram);
        }

        let (min, _) = self.max_min(source)?;
        let mut buckets = vec![0i32; HISTOGRAM_LEN];
        scan(source, |p| {
            let index = i32::from(p) - min;
            let slot = if index < 0 {
                0
            } else {
                (index as usize).min(HISTOGRAM_LEN - 1)
            };
            buckets[slot] += 1;
        })?;

        self.histogram = buckets;
        self.histogram_valid = true;
        Ok(&self.histogram)
    }
}

fn scan<S: GreySource>(source: &mut S, mut visit: impl FnMut(i16)) -> Result<()> {
    let total = source.pixel_count();
    let mut batch = vec![0i16; SCAN_BATCH];
    let mut first = 0u64;
    while first < total {
        let n = (total - first).min(SCAN_BATCH as u64) as usize;
        source.read_grey(first, &mut batch[..n])?;
        batch[..n].iter().copied().for_each(&mut visit);
        first += n as u64;
    }
    Ok(())
}
