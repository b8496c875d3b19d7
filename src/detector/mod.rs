pub mod classifier;
pub mod fusion;
pub mod intent;

pub use fusion::FusionEngine;
