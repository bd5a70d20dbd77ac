pub mod config;
pub mod error;
pub mod export;
pub mod flag;
pub mod lifecycle;
pub mod models;
pub mod reaper;
pub mod scheduler;
pub mod secret;
pub mod store;
pub mod target;
pub mod transfer;
mod util;
pub mod worker;
