//! A readiness-based cooperative task scheduler: suspendable routines are
//! futures, one epoll reactor and one event loop run per worker thread, and
//! a dispatcher hands work between loops.
//!
//! There is no thread-local runtime lookup. Each loop is addressed through
//! its [`Handle`], passed explicitly into every suspension primitive:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let runtime = remolino::runtime::Builder::new_local().try_build().unwrap();
//! let handle = runtime.handle().clone();
//! runtime.block_on(async move {
//!     let greeter = handle.spawn(async { "hello" });
//!     remolino::time::sleep(&handle, Duration::from_millis(10)).await;
//!     assert_eq!(greeter.await.unwrap(), "hello");
//! });
//! ```

#[doc(inline)]
pub use remolino_macros::main;

#[doc(inline)]
pub use remolino_macros::test;

mod event;
pub use event::{Direction, EventId};

mod future;
pub use future::{io, signal, time};

mod reactor;
pub use reactor::{Notifier, ReactorError};

pub mod runtime;
pub use runtime::{Handle, LoopId, Seed};

pub mod task;

mod utils;

#[cfg(test)]
mod test_utils;
