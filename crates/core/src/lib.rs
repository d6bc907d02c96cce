pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod model;
pub mod provider;
pub mod query;
pub mod time;

pub use error::{Result, VigilError};
