//! HTTP front door for the queue facade.
//!
//! `POST /messages` publishes an envelope through whichever provider
//! `QUEUE_PROVIDER` selects; `GET /health` reports that provider. Deliveries
//! from the same queue are logged by [`handler::logging_handler`].

pub mod config;
pub mod handler;
pub mod http;
mod main_logic;

pub use main_logic::{run, serve_queue};
