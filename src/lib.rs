//! In-process client for a sampling heap profiler, plus the offline
//! heap-graph reconstruction used to analyze what it records.
//!
//! The client half is loaded into an arbitrary host process by its allocator
//! runtime. The host reports every malloc/free through the entry points in
//! [`entry`]; the client applies Poisson sampling and forwards the sampled
//! events over a local stream socket to a collector daemon. The graph half
//! ([`graph`]) runs in the analysis pipeline: it rebuilds a reachability
//! graph from interned type/object/reference/root frames and folds retention
//! into a flamegraph.

#[macro_use]
extern crate bitflags;
extern crate bytes;
#[macro_use]
extern crate enum_primitive;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate libc;
#[macro_use]
extern crate log;
extern crate nix;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate strum;
#[macro_use]
extern crate strum_macros;

#[cfg(test)]
extern crate crossbeam_channel;
#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod client;
pub mod entry;
pub mod error;
pub mod graph;
pub mod registry;
pub mod sampler;
pub mod spinlock;
pub mod unhooked;
pub mod wire;

pub use entry::{
    init_session, register_heap, report_allocation, report_free, set_hook_detach_callback,
    shutdown_lazy,
};
pub use registry::{HeapInfo, HEAP_NAME_SZ, MAX_HEAPS};
