//! Worker fleet for the kiln CI engine.
//!
//! Each worker is a cooperatively-scheduled tokio task built on the
//! [`worker`] framework: the crawler converts repository refs into commit
//! rows, the scheduler fans commits out to builds, the agent leases builds
//! and drives the container [`builder`], and the watchdog re-queues stalled
//! runs. Workers coordinate only through the shared data plane; the [`api`]
//! module adds the idempotent nudge endpoints and the signed push webhook.

pub mod agent;
pub mod api;
pub mod builder;
pub mod crawler;
pub mod scheduler;
pub mod scm;
pub mod watchdog;
pub mod worker;
