pub mod actions;
pub mod api;
pub mod cache;
pub mod chat;
pub mod error;
pub mod gateway;
pub mod invalidation;
pub mod models;
pub mod server;
pub mod session;
pub mod settings;
