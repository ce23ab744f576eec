//! Domain Layer
//!
//! Entities, ports and services with no knowledge of sockets or HTTP.

pub mod entities;
pub mod ports;
pub mod services;
