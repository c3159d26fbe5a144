pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod service;
