//! Network surface: one loopback listener serving HTTP health and the
//! WebSocket multiplex channel.

pub mod http;
pub mod startup;
pub mod ws;
