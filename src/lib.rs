//! Watches a camera feed for vehicles and asks a plate-recognition service to
//! read their plates, publishing progress as an observable status.

#[macro_use]
extern crate failure;

pub mod annotate;
pub mod camera;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod frame;
pub mod gate;
pub mod pipeline;
pub mod recognizer;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod types;
