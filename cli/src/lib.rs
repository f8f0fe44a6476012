//! OpenNet CLI - scenario runner for the OpenNet emulation testbed.

pub mod commands;
pub mod output;
pub mod scenario;
