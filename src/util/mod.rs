//! Shared utilities.

pub mod observers;

pub use observers::{ObserverSet, Subscription};
