//! Decorators that sit between a value source and its consumer.

pub mod mean;
pub mod state_change;

pub use mean::MeanFilter;
pub use state_change::StateChangeFilter;
