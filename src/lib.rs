//! Bluetooth host core: device storage, discovery, name resolution and
//! bonding, driven by a single manager actor.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod storage;
