pub mod agent;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod log;
pub mod outbound;
pub mod pid;
pub mod protocol;
pub mod session;
pub mod sys;
pub mod watchdog;
