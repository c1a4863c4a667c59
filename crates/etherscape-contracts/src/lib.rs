pub mod chat;
pub mod dimensions;
pub mod events;
pub mod history;
pub mod models;
pub mod providers;
pub mod settings;
