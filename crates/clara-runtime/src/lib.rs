//! Process lifecycle, swap scheduling and log fan-out for claracore.
//!
//! The heart of the multiplexer: one [`Process`] per configured model,
//! [`Group`]s enforcing swap/exclusivity policy among them, and the
//! [`Manager`] resolving model ids and coordinating cross-group
//! exclusion. The HTTP layer acquires a [`Ticket`] per request and owns
//! byte copying; everything about subprocess life and death lives here.

#![deny(unsafe_code)]

pub mod command;
pub mod group;
pub mod logmux;
pub mod manager;
pub mod process;
mod settings;

pub use group::Group;
pub use logmux::{LogEntry, LogLevel, LogMux, PROXY_SOURCE};
pub use manager::{Manager, ModelStatus};
pub use process::{
    AdmissionMode, Process, ProcessState, RequestGuard, StopMode, Ticket,
};
pub use settings::RuntimeSettings;
