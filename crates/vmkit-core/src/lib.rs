//! VMKit Core Runtime
//!
//! A garbage-collection-oriented runtime substrate for embedding a managed
//! language: thread/stack management with no OS TLS, safepoint-aware locks,
//! a frame-info registry and stack walker, a stop-the-world collection
//! rendezvous, a signal-to-exception bridge, reference/finalizer
//! processing, and the object-header and write-barrier ABI a JIT targets.
//!
//! This crate does not implement any particular garbage-collection
//! algorithm, bytecode interpreter, or class model — see [`plan::GcPlan`]
//! for the boundary a collector implementation sits behind.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod barrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod object;
pub mod plan;
pub mod reference;
pub mod rendezvous;
pub mod runtime;
pub mod signal;
pub mod sync;
pub mod sys;
pub mod thread;

pub use error::{VmkitError, WaitResult};
pub use object::{Closure, ObjectRef, VTable};
pub use plan::GcPlan;
pub use reference::{FinalizationHost, ReferenceKind, ReferenceProcessor};
pub use runtime::{Runtime, RuntimeConfig};
pub use signal::ExceptionHost;
