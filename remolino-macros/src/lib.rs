#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Entry-point macros for the remolino runtime.

mod entry;
mod parse;

/// Marks an async function to be executed by the runtime, setting up a
/// `Runtime` without going through `runtime::Builder` by hand.
///
/// The runtime has no thread-local lookup, so the expansion binds the root
/// loop's handle as `handle` inside the function body; pass it into
/// suspension primitives and `spawn` as usual.
///
/// # Runtime flavors
///
/// The default flavor is `pool` (a root loop plus parked consumer loops,
/// one per worker thread). `worker_threads` defaults to the number of cpus.
///
/// ```no_run
/// #[remolino::main(flavor = "pool", worker_threads = 4)]
/// async fn main() {
///     handle.spawn(async { /* ... */ });
/// }
/// ```
///
/// A single loop on the calling thread:
///
/// ```no_run
/// #[remolino::main(flavor = "local")]
/// async fn main() {}
/// ```
///
/// Equivalent code not using `#[remolino::main]`:
///
/// ```no_run
/// fn main() {
///     let runtime = remolino::runtime::Builder::new_local()
///         .try_build()
///         .expect("Failed building the Runtime");
///     let handle = runtime.handle().clone();
///     runtime.block_on(async move {
///         let _ = &handle;
///     })
/// }
/// ```
///
/// Function arguments are not allowed.
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function to be executed by the runtime as a test. Each
/// test gets its own runtime; the default flavor is `local`.
///
/// Like [`macro@main`], the expansion binds the root loop's handle as
/// `handle` inside the test body.
///
/// ```no_run
/// #[remolino::test]
/// async fn my_test() {
///     let task = handle.spawn(async { 2 + 2 });
///     assert_eq!(task.await.unwrap(), 4);
/// }
/// ```
///
/// A multi-loop test:
///
/// ```no_run
/// #[remolino::test(flavor = "pool", worker_threads = 2)]
/// async fn my_test() {}
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
