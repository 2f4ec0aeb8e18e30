pub mod backend;
pub mod cli;
pub mod config;
pub mod deprovision;
pub mod error;
pub mod exit;
pub mod identity;
pub mod instance;
pub mod locate;
pub mod logging;
pub mod progress;
pub mod provision;
pub mod quantity;
pub mod remote;
pub mod stage;
pub mod util;
pub mod watch;
