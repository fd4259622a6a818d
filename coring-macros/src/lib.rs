#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point macros for the coring reactor.

mod entry;
mod parse;

/// Runs an async function to completion on a freshly built `Reactor` bound
/// to the calling thread.
///
/// The reactor only drives the body and whatever it spawns, submits or
/// schedules onto it. When the body returns, the reactor is dropped.
///
/// # Function arguments
///
/// Function arguments are NOT allowed on `main`.
///
/// # Options
///
/// `ring_size` sets the submission queue depth. It must be a power of two.
///
/// ```ignore
/// #[coring::main(ring_size = 256)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// # Usage
///
/// ```ignore
/// #[coring::main]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[coring::main]`
///
/// ```ignore
/// fn main() {
///     coring::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             println!("Hello world");
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(entry::Entry::Main, args.into(), item.into()).into()
}

/// Marks an async function as a test executed on its own `Reactor`.
///
/// Each test builds a separate reactor on the test thread. Arguments are
/// passed through untouched, so the attribute composes with parametrized test
/// frameworks placed above it.
///
/// ```ignore
/// #[coring::test]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[coring::test]`
///
/// ```ignore
/// #[test]
/// fn my_test() {
///     coring::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             assert!(true);
///         })
/// }
/// ```
///
/// ### Set the ring size
///
/// ```ignore
/// #[coring::test(ring_size = 8)]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(entry::Entry::Test, args.into(), item.into()).into()
}
