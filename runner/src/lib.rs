//! Lifecycle management for QuaLiKiz simulation runs.
//!
//! A [`run::Run`] is a single case with its own working directory, a [`batch::Batch`]
//! is an ordered set of runs that share one backend. Both backends, local processes
//! and Slurm jobs, report completion through the `EXIT_CODE` and `DONE_MARKER`
//! files written by the generated wrapper script.

pub mod backends;
pub mod batch;
pub mod config;
pub mod input;
pub mod paths;
pub mod process;
pub mod run;
