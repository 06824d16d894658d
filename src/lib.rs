//! Live school-bus tracking core.
//!
//! Drivers publish device positions to a shared location table; students
//! and admins mirror that table into a local store and derive arrival
//! estimates and fleet views from it.

pub mod config;
pub mod eta;
pub mod fleet;
pub mod geo;
pub mod home;
pub mod models;
pub mod notify;
pub mod realtime;
pub mod store;
pub mod tracking;

pub use config::Config;
pub use store::LocationStore;
pub use tracking::{TrackingController, TrackingState};
