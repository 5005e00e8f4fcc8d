//! Internal macros for the signaling broker.
//!
//! This crate is intended for inner use only by the broker crate.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::private_intra_doc_links)]
#![forbid(non_ascii_idents, unsafe_code)]

mod dispatchable;

use proc_macro::TokenStream;

/// Generates a `*Handler` trait and a dispatching method for some event
/// represented as an `enum`.
///
/// # How to use
///
/// ### 1. Declare an `enum` for the event variants and a `struct` to handle
/// them.
/// ```ignore
/// use broker_macro::dispatchable;
///
/// #[dispatchable]
/// enum Event {
///     Some { new_bar: i32 },
///     Another,
///     UnnamedVariant(i32, i32),
/// }
///
/// struct Foo {
///     bar: i32,
///     baz: i32,
/// }
/// ```
///
/// ### 2. Implement the generated handler trait for your `struct`.
///
/// For the given `enum` the macro generates a unique trait by appending
/// `Handler` to its name. Each method is named by `snake_case`-ing the
/// variant's name and prefixing it with `on_`.
///
/// ### 3. Dispatch the event with the handler.
///
/// The macro also generates a `dispatch_with()` method that matches on the
/// variant and calls the matching handler method.
#[proc_macro_attribute]
pub fn dispatchable(_args: TokenStream, input: TokenStream) -> TokenStream {
    dispatchable::derive(input)
        .unwrap_or_else(|e| e.to_compile_error().into())
}
