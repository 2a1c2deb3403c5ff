pub mod chat;
pub mod config;
pub mod conversation;
pub mod database;
pub mod goals;
pub mod llm_client;
pub mod profile;
pub mod questions;
pub mod reports;
pub mod routines;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod todos;

#[cfg(test)]
pub mod testing;
