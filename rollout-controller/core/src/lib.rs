#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The event envelope shared by the ingress and reconciler halves.

mod event;

pub use self::event::{Event, EventError};
