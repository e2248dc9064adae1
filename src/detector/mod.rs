pub mod classifier;
pub mod dislocation;
pub mod signal;

pub use classifier::classify;
pub use dislocation::{CycleDetection, Detector};
pub use signal::{ConfirmedParams, FastParams};
