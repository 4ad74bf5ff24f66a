//! HTTP JSON API

pub mod server;

pub use server::{router, run, AppState};
