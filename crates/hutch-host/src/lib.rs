pub mod channels;
pub mod config;
pub mod db;
pub mod ipc;
pub mod router;
pub mod runner;
pub mod scheduler;
