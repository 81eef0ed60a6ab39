pub mod address;
pub mod bonding;
pub mod device;
pub mod discovery;
pub mod eir;
pub mod host;
pub mod manager;
pub mod transport;
pub mod uuid;
