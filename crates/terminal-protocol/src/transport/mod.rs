pub mod connection;
pub mod mock;
pub mod tunnel;

pub use connection::{ConnectionAdapter, Dialer, WireDuplex, WsDialer};
pub use mock::MemoryDialer;
