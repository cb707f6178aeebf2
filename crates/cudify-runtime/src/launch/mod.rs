//! Launch geometry shared by every backend

pub mod types;

pub use types::{Dim3, ExecutionContext, LaunchConfig, MAX_GRID_X, MAX_GRID_YZ, MAX_THREADS_PER_BLOCK};
