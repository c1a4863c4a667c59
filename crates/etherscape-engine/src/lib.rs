pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod media;
pub mod notify;
pub mod orchestrator;
pub mod realtime;
pub mod runner;
pub mod theme;
pub mod upload;
