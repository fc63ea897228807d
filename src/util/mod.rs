//! Pure helpers shared by the synchronizer, the router and the join decomposer.

pub mod resolver;
pub mod weighted;

pub use resolver::resolve_dependencies;
pub use weighted::{pick_weighted, pick_weighted_with};
