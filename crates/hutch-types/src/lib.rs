pub mod chat;
pub mod config;
pub mod container;
pub mod ipc;
pub mod task;
