//! reaper-slurm — the scheduler side of a suspend run.
//!
//! [`SchedulerControl`] wraps the two scheduler commands a run needs:
//! hostlist expansion and node state updates. [`Scontrol`] implements it
//! by shelling out to `scontrol`.
//!
//! [`NodeStateDriver`] owns the per-node state machine:
//!
//! ```text
//! Schedulable ──down──▶ AdminDown ──power_down──▶ PowerDown ──resume──▶ Schedulable
//!      │                                              ▲
//!      └──────────── (idle policy, no command) ───────┘
//! ```
//!
//! Command failures are logged and never abort the run; a node whose
//! resume fails stays in `PowerDown`.

pub mod control;
pub mod driver;
pub mod error;

pub use control::{NodeStateCommand, SchedulerControl, Scontrol};
pub use driver::{NodePhase, NodeStateDriver, Transition};
pub use error::{SlurmError, SlurmResult};
