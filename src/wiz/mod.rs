pub mod ble;
pub mod controller;
pub mod discovery;
pub mod network;
pub mod polling;
pub mod probe;
pub mod protocol;
pub mod scenes;
pub mod status;

#[cfg(test)]
pub mod fake_bulb;
