pub mod price_state;

pub use price_state::{apply_observation, Transition};
