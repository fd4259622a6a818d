use crate::parse::{Options, is_test_attribute, tail_spans, with_error};
use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{AttrStyle, ItemFn, ReturnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    Main,
    Test,
}

/// Rewrites
///
/// ```text
/// #[coring::main(ring_size = 128)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// into a synchronous function that builds a reactor and blocks on the body.
pub(crate) fn expand(entry: Entry, args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(e) => return with_error(item, e),
    };

    let options = check(entry, &input).and_then(|()| syn::parse2::<Options>(args));

    match options {
        Ok(options) => generate(entry, input, &options),
        // Still expand the body so IDE completions keep working inside it.
        Err(e) => with_error(generate(entry, input, &Options::default()), e),
    }
}

fn check(entry: Entry, input: &ItemFn) -> syn::Result<()> {
    if input.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            input.sig.fn_token,
            "the `async` keyword is missing from the function declaration",
        ));
    }

    match entry {
        Entry::Main if input.sig.ident == "main" && !input.sig.inputs.is_empty() => Err(
            syn::Error::new_spanned(&input.sig.inputs, "the main function cannot accept arguments"),
        ),
        Entry::Main => Ok(()),
        Entry::Test => match input.attrs.iter().find(|attr| is_test_attribute(attr)) {
            Some(attr) => Err(syn::Error::new_spanned(
                attr,
                "second test attribute is supplied, consider removing or changing the order of your test attributes",
            )),
            None => Ok(()),
        },
    }
}

fn generate(entry: Entry, input: ItemFn, options: &Options) -> TokenStream {
    let ItemFn {
        mut attrs,
        vis,
        mut sig,
        block,
    } = input;

    sig.asyncness = None;

    // Inner attributes cannot stay inside the rewritten body.
    for attr in &mut attrs {
        attr.style = AttrStyle::Outer;
    }

    let (start, end) = tail_spans(&block);

    let mut builder = quote_spanned! {start=> coring::runtime::Builder::new() };
    if let Some(size) = options.ring_size {
        builder = quote_spanned! {start=> #builder.ring_size(#size) };
    }

    let future = match entry {
        Entry::Main => quote! {
            let body = async #block;
        },
        // Tests share one `block_on` instantiation per output type.
        Entry::Test => {
            let output = match &sig.output {
                ReturnType::Default => quote! { () },
                ReturnType::Type(_, ty) => quote! { #ty },
            };
            quote! {
                let body = async #block;
                let body: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output>> =
                    ::core::pin::pin!(body);
            }
        }
    };

    let run = quote_spanned! {end=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #builder
                .try_build()
                .expect("failed to build the reactor")
                .block_on(body);
        }
    };

    let test_attr = (entry == Entry::Test).then(|| quote! { #[::core::prelude::v1::test] });

    quote! {
        #(#attrs)*
        #test_attr
        #vis #sig {
            #future
            #run
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;

    // Whitespace free, token spacing is not part of the contract.
    fn expand_str(entry: Entry, args: TokenStream, item: TokenStream) -> String {
        expand(entry, args, item).to_string().split_whitespace().collect()
    }

    #[test]
    fn test_main_blocks_on_body() {
        let out = expand_str(
            Entry::Main,
            quote! { ring_size = 128 },
            quote! { async fn main() { work().await; } },
        );

        assert!(out.contains("fnmain()"));
        assert!(!out.contains("asyncfn"));
        assert!(out.contains("ring_size(128usize)"));
        assert!(out.contains("block_on(body)"));
    }

    #[test]
    fn test_test_adds_attribute_and_pins_body() {
        let out = expand_str(
            Entry::Test,
            TokenStream::new(),
            quote! { async fn checks() -> anyhow::Result<()> { Ok(()) } },
        );

        assert!(out.contains("#[::core::prelude::v1::test]"));
        assert!(out.contains("Output=anyhow::Result<()>"));
        assert!(!out.contains("compile_error"));
    }

    #[test]
    fn test_rejects_bad_options() {
        for args in [
            quote! { ring_size = 100 },
            quote! { ring_size },
            quote! { ring_size = "64" },
            quote! { ring_size = 8, ring_size = 16 },
            quote! { flavor = "multi_thread" },
            quote! { entries = 8 },
        ] {
            let out = expand_str(Entry::Test, args, quote! { async fn t() {} });
            assert!(out.contains("compile_error"), "accepted: {out}");
        }
    }

    #[test]
    fn test_rejects_sync_fn_and_duplicate_test_attribute() {
        let out = expand_str(Entry::Main, TokenStream::new(), quote! { fn main() {} });
        assert!(out.contains("compile_error"));

        let out = expand_str(
            Entry::Test,
            TokenStream::new(),
            quote! { #[test] async fn t() {} },
        );
        assert!(out.contains("secondtestattribute"));
    }
}
