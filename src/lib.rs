pub mod audio;
pub mod chat;
pub mod config;
pub mod constants;
pub mod data_layer;
pub mod error;
pub mod serving;
pub mod services;
pub mod speech;
pub mod store;
pub mod translate;
pub mod tts;
pub mod web_server;

pub use error::{BuddyError, Result};
