//! Local control plane for the VibeTunnel server: the Mac app control
//! socket, the `vt` API socket, and the Git follow-mode plumbing behind them.

pub mod api;
pub mod clock;
pub mod config;
pub mod control;
pub mod correlator;
pub mod follow;
pub mod frame;
pub mod git;
pub mod hooks;
pub mod logging;
