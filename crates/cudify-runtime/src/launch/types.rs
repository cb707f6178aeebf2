//! Launch geometry: coordinates, launch configuration and per-thread positions

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Largest block the emulator accepts, matching common hardware limits.
pub const MAX_THREADS_PER_BLOCK: u64 = 1024;
/// Largest grid extent along x.
pub const MAX_GRID_X: u32 = i32::MAX as u32;
/// Largest grid extent along y and z.
pub const MAX_GRID_YZ: u32 = 65535;

/// Three-component coordinate or extent.
///
/// Used both for indices (`threadIdx`, `blockIdx`) and for dimensions
/// (`blockDim`, `gridDim`). Linearisation is x-fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ZERO: Dim3 = Dim3 { x: 0, y: 0, z: 0 };
    pub const ONE: Dim3 = Dim3 { x: 1, y: 1, z: 1 };

    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// `(n, 1, 1)`
    pub const fn linear(n: u32) -> Self {
        Self { x: n, y: 1, z: 1 }
    }

    /// `(x, y, 1)`
    pub const fn plane(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }

    /// Number of points in the extent, saturating at `u64::MAX`.
    pub const fn volume(&self) -> u64 {
        (self.x as u64).saturating_mul(self.y as u64).saturating_mul(self.z as u64)
    }

    pub const fn has_zero(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    /// Whether this index lies inside `extent` on every axis.
    pub const fn is_within(&self, extent: Dim3) -> bool {
        self.x < extent.x && self.y < extent.y && self.z < extent.z
    }

    /// Row-major linear index of this coordinate inside `extent`.
    pub const fn linear_in(&self, extent: Dim3) -> u64 {
        let dx = extent.x as u64;
        let dy = extent.y as u64;
        self.x as u64 + self.y as u64 * dx + self.z as u64 * dx * dy
    }

    /// Inverse of [`linear_in`](Self::linear_in).
    ///
    /// `extent` must have no zero component.
    pub const fn from_linear(index: u64, extent: Dim3) -> Self {
        let dx = extent.x as u64;
        let dxy = dx * extent.y as u64;
        Self {
            x: (index % dx) as u32,
            y: ((index % dxy) / dx) as u32,
            z: (index / dxy) as u32,
        }
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Grid and block extents of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Blocks in each dimension
    pub grid: Dim3,
    /// Threads per block in each dimension
    pub block: Dim3,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grid: Dim3::ONE,
            block: Dim3::ONE,
        }
    }
}

impl LaunchConfig {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
        }
    }

    /// One-dimensional launch covering `total_elements` with `ceil(total / block_size)` blocks.
    pub const fn linear(total_elements: u32, block_size: u32) -> Self {
        let blocks = if block_size == 0 {
            0
        } else {
            total_elements.div_ceil(block_size)
        };
        Self {
            grid: Dim3::linear(blocks),
            block: Dim3::linear(block_size),
        }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.grid.volume()
    }

    pub const fn threads_per_block(&self) -> u64 {
        self.block.volume()
    }

    /// Saturates at `u64::MAX`; [`validate`](Self::validate) rejects such grids.
    pub const fn total_threads(&self) -> u64 {
        self.total_blocks().saturating_mul(self.threads_per_block())
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid.has_zero() {
            return Err(BackendError::invalid_launch(format!("grid {} has a zero dimension", self.grid)));
        }
        if self.block.has_zero() {
            return Err(BackendError::invalid_launch(format!(
                "block {} has a zero dimension",
                self.block
            )));
        }
        if self.grid.x > MAX_GRID_X || self.grid.y > MAX_GRID_YZ || self.grid.z > MAX_GRID_YZ {
            return Err(BackendError::invalid_launch(format!(
                "grid {} exceeds the limits ({MAX_GRID_X}, {MAX_GRID_YZ}, {MAX_GRID_YZ})",
                self.grid
            )));
        }
        if self.total_blocks().checked_mul(self.threads_per_block()).is_none() {
            return Err(BackendError::invalid_launch(format!(
                "{self} has more threads than fit in 64 bits"
            )));
        }
        if self.threads_per_block() > MAX_THREADS_PER_BLOCK {
            return Err(BackendError::invalid_launch(format!(
                "block {} has {} threads, limit is {}",
                self.block,
                self.threads_per_block(),
                MAX_THREADS_PER_BLOCK
            )));
        }
        Ok(())
    }

    /// Block coordinate of the `index`-th block in x-fastest order.
    pub const fn block_coords(&self, index: u64) -> Dim3 {
        Dim3::from_linear(index, self.grid)
    }

    /// Thread coordinate of the `index`-th thread of a block in x-fastest order.
    pub const fn thread_coords(&self, index: u64) -> Dim3 {
        Dim3::from_linear(index, self.block)
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={}, block={}", self.grid, self.block)
    }
}

/// Position of one simulated thread in the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub block_idx: Dim3,
    pub thread_idx: Dim3,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
}

impl ExecutionContext {
    pub const fn new(block_idx: Dim3, thread_idx: Dim3, grid_dim: Dim3, block_dim: Dim3) -> Self {
        Self {
            block_idx,
            thread_idx,
            grid_dim,
            block_dim,
        }
    }

    pub const fn block_linear_index(&self) -> u64 {
        self.block_idx.linear_in(self.grid_dim)
    }

    pub const fn thread_linear_index(&self) -> u64 {
        self.thread_idx.linear_in(self.block_dim)
    }

    /// `blockIdx * threads_per_block + threadIdx`, linearised.
    pub const fn global_thread_index(&self) -> u64 {
        self.block_linear_index() * self.block_dim.volume() + self.thread_linear_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dim3_volume_and_display() {
        let d = Dim3::new(2, 3, 4);
        assert_eq!(d.volume(), 24);
        assert_eq!(d.to_string(), "(2, 3, 4)");
        assert_eq!(Dim3::linear(7).volume(), 7);
        assert_eq!(Dim3::plane(4, 4).volume(), 16);
        assert!(Dim3::new(1, 0, 1).has_zero());
    }

    #[test]
    fn linearisation_is_x_fastest() {
        let extent = Dim3::new(4, 3, 2);
        assert_eq!(Dim3::new(1, 0, 0).linear_in(extent), 1);
        assert_eq!(Dim3::new(0, 1, 0).linear_in(extent), 4);
        assert_eq!(Dim3::new(0, 0, 1).linear_in(extent), 12);
        for i in 0..extent.volume() {
            let c = Dim3::from_linear(i, extent);
            assert!(c.is_within(extent));
            assert_eq!(c.linear_in(extent), i);
        }
    }

    #[test]
    fn huge_grids_are_rejected_without_overflowing() {
        let max = Dim3::new(u32::MAX, u32::MAX, u32::MAX);
        assert_eq!(max.volume(), u64::MAX);

        let config = LaunchConfig::new(max, (1024, 1, 1));
        assert_eq!(config.total_threads(), u64::MAX);
        assert!(matches!(config.validate(), Err(BackendError::InvalidLaunchConfig(_))));

        assert!(LaunchConfig::new((1, MAX_GRID_YZ + 1, 1), (1, 1, 1)).validate().is_err());
        assert!(LaunchConfig::new((1, 1, MAX_GRID_YZ + 1), (1, 1, 1)).validate().is_err());
        assert!(LaunchConfig::new((MAX_GRID_X, MAX_GRID_YZ, MAX_GRID_YZ), (1024, 1, 1))
            .validate()
            .is_err());
        LaunchConfig::new((MAX_GRID_X, MAX_GRID_YZ, MAX_GRID_YZ), (1, 1, 1))
            .validate()
            .unwrap();
    }

    #[test]
    fn linear_launch_rounds_up() {
        let config = LaunchConfig::linear(1000, 256);
        assert_eq!(config.grid, Dim3::linear(4));
        assert_eq!(config.block, Dim3::linear(256));
        assert_eq!(config.total_threads(), 1024);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_and_oversized_blocks() {
        assert!(LaunchConfig::linear(10, 0).validate().is_err());
        assert!(LaunchConfig::new((0, 1, 1), (1, 1, 1)).validate().is_err());
        assert!(LaunchConfig::new((1, 1, 1), (32, 32, 2)).validate().is_err());
        assert!(LaunchConfig::new((1, 1, 1), (32, 32, 1)).validate().is_ok());
    }

    #[test]
    fn execution_context_indices() {
        let ctx = ExecutionContext::new(
            Dim3::new(1, 2, 0),
            Dim3::new(5, 10, 0),
            Dim3::new(4, 4, 2),
            Dim3::new(8, 16, 1),
        );
        assert_eq!(ctx.block_linear_index(), 9);
        assert_eq!(ctx.thread_linear_index(), 85);
        assert_eq!(ctx.global_thread_index(), 9 * 128 + 85);
    }
}
