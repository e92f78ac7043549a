//! chat-service: streams provider answers to the chat dashboard and keeps
//! each user's conversation history.
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod turn;
