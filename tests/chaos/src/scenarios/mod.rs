//! Fault-injection scenarios.
//!
//! - `lifecycle` - deploy, bootstrap retry, abort, teardown, fixture files
//! - `partition` - partitions, link failures, tie-break, rotations
//! - `membership` - layout add/remove, epoch monotonicity
//! - `power` - power cycles, quorum loss, parallel batches
//! - `real_backends` - the same shapes on Docker and a VM lab (ignored)
//!
//! | Module | Backend | Runnable |
//! |--------|---------|----------|
//! | lifecycle | simulated | yes |
//! | partition | simulated | yes |
//! | membership | simulated | yes |
//! | power | simulated (VM flavor) | yes |
//! | real_backends | Docker / VM lab | `--ignored` |

pub mod lifecycle;
pub mod membership;
pub mod partition;
pub mod power;
pub mod real_backends;
