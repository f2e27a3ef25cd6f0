pub mod channel;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod daemon;
pub mod lifecycle;
pub mod line;
