use proc_macro2::{Span, TokenStream};
use quote::ToTokens;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Block, Ident, Lit, Token};

const KNOWN_OPTIONS: &str = "`ring_size`";

/// Arguments of `#[coring::main(..)]` and `#[coring::test(..)]`.
#[derive(Debug, Default)]
pub(crate) struct Options {
    pub(crate) ring_size: Option<usize>,
}

// A single `name = value` argument. The value is optional while parsing so a
// bare `ring_size` gets a precise error instead of a syntax error.
struct Knob {
    name: Ident,
    value: Option<Lit>,
}

impl Parse for Knob {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let name: Ident = input.parse()?;

        let value = if input.peek(Token![=]) {
            input.parse::<Token![=]>()?;
            let value = input.parse::<Lit>().map_err(|e| {
                syn::Error::new(e.span(), format!("`{name}` expects a literal value"))
            })?;
            Some(value)
        } else {
            None
        };

        Ok(Knob { name, value })
    }
}

impl Parse for Options {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut options = Options::default();

        for knob in Punctuated::<Knob, Token![,]>::parse_terminated(input)? {
            options.apply(knob)?;
        }

        Ok(options)
    }
}

impl Options {
    fn apply(&mut self, knob: Knob) -> syn::Result<()> {
        let name = knob.name.to_string();

        match (name.as_str(), knob.value) {
            ("ring_size", Some(_)) if self.ring_size.is_some() => Err(syn::Error::new_spanned(
                &knob.name,
                "`ring_size` set multiple times",
            )),
            ("ring_size", Some(value)) => {
                self.ring_size = Some(parse_ring_size(value)?);
                Ok(())
            }
            ("ring_size", None) => Err(syn::Error::new_spanned(
                &knob.name,
                "`ring_size` requires a value, e.g. `ring_size = 64`",
            )),
            ("flavor" | "worker_threads", _) => Err(syn::Error::new_spanned(
                &knob.name,
                format!("`{name}` is not supported, a reactor always runs on the calling thread"),
            )),
            (_, _) => Err(syn::Error::new_spanned(
                &knob.name,
                format!("unknown option `{name}`, expected one of: {KNOWN_OPTIONS}"),
            )),
        }
    }
}

fn parse_ring_size(value: Lit) -> syn::Result<usize> {
    let Lit::Int(lit) = &value else {
        return Err(syn::Error::new_spanned(value, "`ring_size` must be an integer"));
    };

    let size: usize = lit.base10_parse()?;
    if !size.is_power_of_two() {
        return Err(syn::Error::new_spanned(
            lit,
            "`ring_size` must be a non-zero power of two",
        ));
    }

    Ok(size)
}

/// Whether `attr` is `#[test]`, or the same attribute spelled through a
/// `core` or `std` prelude.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }

    let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match segments.as_slice() {
        ["test"] => path.leading_colon.is_none(),
        ["core" | "std", "prelude", _, "test"] => true,
        _ => false,
    }
}

/// Spans of the first and last token of the block's final statement. Type
/// errors on the body's output are reported there.
pub(crate) fn tail_spans(block: &Block) -> (Span, Span) {
    let Some(last) = block.stmts.last() else {
        return (Span::call_site(), Span::call_site());
    };

    let mut tokens = last.to_token_stream().into_iter();
    let start = tokens.next().map_or_else(Span::call_site, |t| t.span());
    let end = tokens.last().map_or(start, |t| t.span());

    (start, end)
}

pub(crate) fn with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
