// Core modules implementing the console proxy: upstream link, fan-out, arbitration, logging.
pub mod arbiter;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod listener;
pub mod registry;
pub mod session;
pub mod session_log;
pub mod supervisor;
pub mod upstream;
