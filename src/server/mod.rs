pub mod auth;
pub mod calls;
pub mod config;
pub mod database;
pub mod error;
pub mod groups;
pub mod hub;
pub mod messages;
pub mod presence;
pub mod redis_bridge;
pub mod rooms;
pub mod users;
pub mod websocket;
