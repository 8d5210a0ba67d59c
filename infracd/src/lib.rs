//! Continuous-delivery runner for terraform configurations.
//!
//! One invocation assembles a workspace from local directories, git
//! repositories and generated backend files, decides from the previously
//! recorded run whether to act, runs a single terraform command, and records
//! the outcome for the next invocation.
//!
//! - **[`core`]**: Pure decisions (recurrence gate, forbidden operations) and
//!   the persisted data model. No I/O.
//! - **[`io`]**: Filesystem, subprocess and network bindings behind small seams
//!   ([`io::terraform::Provisioner`], [`io::state_store::StateStore`]).
//!
//! [`run`] ties them together; [`workspace`] owns the per-run directory and
//! [`execute`] dispatches the configured command.
//!
//! A `destroy` that has been recorded once is never repeated while a
//! recurrence policy is configured.

pub mod core;
pub mod error;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
