pub mod actors;
pub mod app;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod notification;
pub mod presence;
pub mod queue;
pub mod runner;
pub mod tailer;
pub mod timeout;
pub mod timer;
pub mod util;
