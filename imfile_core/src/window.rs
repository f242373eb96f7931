//! Planning of contiguous byte runs for N-dimensional sub-window access.
//!
//! Pixels are stored with dimension 0 varying slowest and the last dimension
//! innermost. A window is split into the fewest runs it can be: for up to
//! three dimensions neighbouring runs are merged whenever every inner
//! dimension is covered in full; higher ranks use an odometer walk that emits
//! one run per combination of the outer indices.

use crate::error::{ImageError, Result};

/// Inclusive `(low, high)` index range per dimension, plus a subsampling
/// stride per dimension that must stay at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    ranges: Vec<(usize, usize)>,
    coarseness: Vec<usize>,
}

impl Window {
    pub fn new(ranges: Vec<(usize, usize)>) -> Self {
        let coarseness = vec![1; ranges.len()];
        Self { ranges, coarseness }
    }

    /// Window covering every pixel of `shape`.
    pub fn full(shape: &[usize]) -> Self {
        Self::new(shape.iter().map(|&e| (0, e.saturating_sub(1))).collect())
    }

    pub fn with_coarseness(mut self, coarseness: Vec<usize>) -> Self {
        self.coarseness = coarseness;
        self
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// Number of pixels selected. Only meaningful after [`Window::validate`].
    pub fn pixel_count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo + 1) as u64)
            .product()
    }

    /// Check the window against an image shape.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        if self.ranges.len() != shape.len() || self.coarseness.len() != shape.len() {
            return Err(ImageError::param(format!(
                "Window has {} dimensions, image has {}",
                self.ranges.len(),
                shape.len()
            )));
        }
        if self.coarseness.iter().any(|&c| c != 1) {
            return Err(ImageError::param("Coarseness not implemented"));
        }
        for (dim, (&(lo, hi), &extent)) in self.ranges.iter().zip(shape).enumerate() {
            if lo > hi || hi >= extent {
                return Err(ImageError::param(format!(
                    "Invalid window [{}, {}] for dimension {} of extent {}",
                    lo, hi, dim, extent
                )));
            }
        }
        Ok(())
    }
}

/// One contiguous transfer: byte offset from the start of the pixel region,
/// and length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub offset: u64,
    pub len: usize,
}

/// Validate `window` and plan its runs in buffer order.
pub fn plan_runs(shape: &[usize], window: &Window, elem: usize) -> Result<Vec<Run>> {
    window.validate(shape)?;
    let runs = if shape.len() <= 3 {
        merged_runs(shape, window.ranges(), elem)
    } else {
        odometer_runs(shape, window.ranges(), elem)
    };
    Ok(runs)
}

/// Element stride of each dimension: the product of all inner extents.
fn strides(shape: &[usize]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1] as u64;
    }
    strides
}

fn merged_runs(shape: &[usize], ranges: &[(usize, usize)], elem: usize) -> Vec<Run> {
    let n = shape.len();
    if n == 0 {
        return Vec::new();
    }
    let strides = strides(shape);

    // Dimensions `split..n` collapse into one run: every one of them except
    // `split` itself spans its full extent.
    let mut split = n - 1;
    while split > 0 && ranges[split] == (0, shape[split] - 1) {
        split -= 1;
    }
    let (lo, hi) = ranges[split];
    let run_len = (hi - lo + 1) * strides[split] as usize * elem;
    let run_base = lo as u64 * strides[split];

    let outer = &ranges[..split];
    let mut index: Vec<usize> = outer.iter().map(|&(lo, _)| lo).collect();
    let mut runs = Vec::new();
    loop {
        let element: u64 = index
            .iter()
            .zip(&strides)
            .map(|(&i, &s)| i as u64 * s)
            .sum::<u64>()
            + run_base;
        runs.push(Run {
            offset: element * elem as u64,
            len: run_len,
        });
        if !advance(&mut index, outer) {
            break;
        }
    }
    runs
}

/// Generic walk: one run per combination of all but the innermost index.
pub fn odometer_runs(shape: &[usize], ranges: &[(usize, usize)], elem: usize) -> Vec<Run> {
    let n = shape.len();
    if n == 0 {
        return Vec::new();
    }
    let slice_size: Vec<u64> = strides(shape).iter().map(|s| s * elem as u64).collect();
    let (inner_lo, inner_hi) = ranges[n - 1];
    let run_len = (inner_hi - inner_lo + 1) * elem;

    let outer = &ranges[..n - 1];
    let mut index: Vec<usize> = outer.iter().map(|&(lo, _)| lo).collect();
    let mut runs = Vec::new();
    loop {
        let offset = index
            .iter()
            .zip(&slice_size)
            .map(|(&i, &s)| i as u64 * s)
            .sum::<u64>()
            + inner_lo as u64 * slice_size[n - 1];
        runs.push(Run { offset, len: run_len });
        if !advance(&mut index, outer) {
            break;
        }
    }
    runs
}

/// Mixed-radix increment, last index fastest. Returns false once every
/// combination has been visited.
fn advance(index: &mut [usize], ranges: &[(usize, usize)]) -> bool {
    for d in (0..index.len()).rev() {
        if index[d] < ranges[d].1 {
            index[d] += 1;
            return true;
        }
        index[d] = ranges[d].0;
    }
    false
}
