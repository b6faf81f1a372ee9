pub mod classifier;
pub mod config;
pub mod credentials;
pub mod drive;
pub mod logging;
pub mod telegram;
pub mod watcher;
