#[macro_use]
extern crate tracing;

mod cluster;
mod wait;

pub use cluster::{assignments, complete_task, create_task, spawn_worker};
pub use wait::wait_until;
