//! Destination binding.
//!
//! Before each streaming attempt the worker asks a [`DestinationBinder`] for
//! the ingest key of a broadcast on the destination platform. Creating that
//! broadcast through the platform's API is left to an external hook.

mod binder;

pub use binder::{
    BindFailure, CommandDestination, Destination, DestinationBinder, StaticDestination,
    binder_for, ingest_url,
};
