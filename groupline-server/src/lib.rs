pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod events;
pub mod hub;
pub mod membership;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod store;
pub mod types;
pub mod web;
