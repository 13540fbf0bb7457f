//! End-to-end harness: a real server on a loopback port, seeded through the
//! store, driven by WebSocket and HTTP clients.

pub mod harness;
