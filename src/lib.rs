//! taro tracks job instances through their lifecycle and exposes running
//! instances to other processes over local datagram sockets.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod job;
pub mod listening;
pub mod log;
pub mod paths;
pub mod persistence;
pub mod plugin;
pub mod process;
pub mod runner;
pub mod socket;
pub mod testing;
pub mod ui;
