//! Idempotent, retryable provisioning of a security-tooling Linux desktop.
//!
//! A run is an ordered list of steps read from a declarative plan. Each step
//! is skipped when its effect is already present, carries a failure policy
//! (fatal or tolerant) and may retry with bounded exponential backoff. After
//! the steps, an independent verification pass re-probes the system and the
//! operator gets a summary.
//!
//! - **Identity** - Resolve the non-root user the run provisions for
//! - **Executor** - Run external tools as root or as that user
//! - **Steps** - Check/action pairs interpreted by a sequential runner
//! - **Retry** - Backoff with an interruptible sleep
//! - **Verification and report** - Independent probes, operator summary
//!
//! # Architecture
//!
//! ```text
//! desk-provision (bin)
//!     │
//!     └── session
//!           ├── identity ─── passwd
//!           ├── plan ─────── Steps + VerificationItems (TOML)
//!           ├── lock, preflight
//!           ├── step::runner ── retry ── cancel
//!           │       └── step::action ── executor (files, directories)
//!           ├── verify
//!           └── run_manifest
//!     report (rendered by the bin)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use desk_provision::executor::{CommandSpec, SystemExecutor};
//! use desk_provision::step::{self, run_all, Step, StepContext};
//!
//! let steps = vec![Step::new(
//!     "apt: nmap",
//!     step::run(CommandSpec::new("apt-get", ["install", "-y", "nmap"])),
//! )
//! .retrying()];
//! let result = run_all(&steps, &ctx);
//! ```

pub mod cancel;
pub mod executor;
pub mod identity;
pub mod lock;
pub mod log;
pub mod plan;
pub mod preflight;
pub mod report;
pub mod retry;
pub mod run_manifest;
pub mod session;
pub mod step;
pub mod verify;

pub use identity::Identity;
pub use plan::Plan;
pub use session::{Mode, Session, SessionError, SessionReport};
pub use step::{FailurePolicy, RunResult, Step, StepOutcome, StepStatus};
