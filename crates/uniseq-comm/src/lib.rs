//! Process groups and the head-sharding exchange
//!
//! - [`ProcessGroup`]: membership queries plus the all-to-all and
//!   point-to-point primitives, each bound to a lane channel
//! - [`LocalProcessGroup`]: in-process groups for simulation and tests
//! - [`HybridTopology`]: ulysses x ring group construction
//! - [`seq_all_to_all_4d`] / [`HeadExchange`]: sequence-sharded to
//!   head-sharded re-layout and its inverse

pub mod exchange;
pub mod group;
pub mod topology;

pub use exchange::{seq_all_to_all_4d, HeadExchange, HeadRange};
pub use group::{LocalProcessGroup, ProcessGroup};
pub use topology::{HybridGroups, HybridTopology};
