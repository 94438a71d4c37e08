pub mod channel;
pub mod config;
pub mod negotiation;
pub mod observer;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
