pub mod chat;
pub mod config;
pub mod conversation;
pub mod inference;
pub mod logging;
pub mod runner;
