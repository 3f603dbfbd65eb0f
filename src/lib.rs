#[macro_use]
extern crate tracing;

pub mod bus;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod keyboard;
pub mod motion;
pub mod server;
pub mod session;
pub mod tls;
pub mod wamp;
