pub mod api;
pub mod auth;
pub mod completion;
pub mod config;
pub mod error;
pub mod hub;
pub mod state;
pub mod store;

pub use api::router;
pub use state::{AppState, Settings};
