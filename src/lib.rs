//! Discovery and control of WiZ smart bulbs over their local JSON/UDP
//! protocol.
//!
//! [`registry::BulbRegistry`] is the entry point for commands. It owns the
//! cached bulbs and groups and talks to the bulbs through a shared
//! [`wiz::controller::BulbController`].

pub mod bulb;
pub mod energy;
pub mod protocols;
pub mod registry;
pub mod settings;
pub mod store;
pub mod wiz;
