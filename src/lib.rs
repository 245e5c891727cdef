//! Lead finder: search businesses through the places API, keep a reviewed
//! list with categories in a live document store, and reach out to them.

pub mod config;
pub mod contact;
pub mod docstore;
pub mod local;
pub mod model;
pub mod panel;
pub mod places;
pub mod reviewed;
pub mod session;
pub mod usage;
