pub mod normalizer;
pub mod value_edge;

pub use normalizer::{normalize, top_picks};
pub use value_edge::compute_edge;
