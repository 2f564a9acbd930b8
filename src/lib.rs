//! # Foreman
//! Master failover and task (re)assignment on top of a hierarchical
//! coordination service.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Foreman:
//!
//! ### Features
//! - `foreman_coordination` - The capability interface consumed from the coordination
//!   service, the cluster namespace layout and, with `test-utils`, an in-memory
//!   coordination service.
//! - `foreman_master` - Leader election, membership tracking and the assignment engine
//!   moving tasks between workers.

#[cfg(feature = "foreman-coordination")]
pub use foreman_coordination as coordination;
#[cfg(feature = "foreman-master")]
pub use foreman_master as master;
