#![forbid(unsafe_code)]

//! # wizard
//!
//! Client-side orchestration for the edulution setup wizard. The UI layer is
//! an external collaborator; this crate owns the parts with real moving pieces:
//!
//! - Health checks against the installer backend, with an "all passed" gate
//! - Remote bootstrap of a linuxmuster.net server, followed through a
//!   reconnecting progress feed
//! - Live output of the install playbook over a push socket
//! - The final commit + restart handoff, polling until the installed
//!   application answers again
//!
//! All mutable wizard state lives in an explicit [`state::WizardStore`] that
//! is handed to every component.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod finalize;
pub mod health;
pub mod log;
pub mod session;
pub mod state;

pub use error::{Result, WizardError};
pub use session::WizardSession;
pub use state::{JobKind, JobStatus, WizardStore};
