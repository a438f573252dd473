pub mod clear;
pub mod config;
pub mod context;
pub mod daemon;
pub mod friends;
pub mod matches;
pub mod prompts;
pub mod stats;
pub mod sync;
pub mod sync_ui;
