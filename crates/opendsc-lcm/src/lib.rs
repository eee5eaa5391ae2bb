//! # OpenDSC Local Configuration Manager
//!
//! Long-running agent that resolves its configuration (local file or pulled
//! bundle), runs the enforcement binary in Monitor or Remediate mode on a
//! configurable interval, hot-reloads its own settings with mode and
//! interval changes interrupting an in-progress wait, manages the mTLS
//! client certificate with automatic rotation, and submits compliance
//! reports.

pub mod certs;
pub mod executor;
pub mod paths;
pub mod pull;
pub mod settings;
pub mod worker;

pub use settings::{LcmSettings, SettingsStore};
pub use worker::Worker;
