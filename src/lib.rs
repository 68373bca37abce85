//! A sampling facade over `perf_event_open(2)` for tracing the memory
//! addresses a process's retired loads and stores touch, built on Intel's
//! PEBS load/store sampling events.
//!
//! The public surface is two types: [`Channel`], one kernel counter + ring
//! buffer for a single (pid, event class) pair, and [`ChannelSet`], which
//! manages a Channel group per tracked process and multiplexes readiness
//! across all of them.

#[macro_use]
extern crate failure_derive;
extern crate failure;
#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate nix;
#[macro_use]
extern crate log;

mod channel;
mod channel_set;
mod error;
mod fd;
mod raw;
mod ring_buffer;
mod sample;

pub use crate::channel::Channel;
pub use crate::channel_set::ChannelSet;
pub use crate::error::{Error, Result};
pub use crate::sample::{EventClass, Sample};
