use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, parse_macro_input, spanned::Spanned};

/// Marks a test that runs inside a `test` span with the crate's log
/// subscriber installed. Async tests go through `#[tokio::test]` and take its
/// arguments unchanged:
///
/// ```ignore
/// #[shardlease::test(flavor = "multi_thread", worker_threads = 2)]
/// async fn racing_workers() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand(TokenStream2::from(attr), input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(runtime_args: TokenStream2, input: ItemFn) -> syn::Result<TokenStream2> {
    if !input.sig.inputs.is_empty() {
        return Err(syn::Error::new(
            input.sig.inputs.span(),
            "test functions cannot take arguments",
        ));
    }
    let is_async = input.sig.asyncness.is_some();
    if !is_async && !runtime_args.is_empty() {
        return Err(syn::Error::new(
            runtime_args.span(),
            "runtime arguments only apply to async tests",
        ));
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let name = sig.ident.to_string();

    Ok(if is_async {
        let runtime = if runtime_args.is_empty() {
            quote! { #[tokio::test] }
        } else {
            quote! { #[tokio::test(#runtime_args)] }
        };
        quote! {
            #runtime
            #(#attrs)*
            #vis #sig {
                ::shardlease::trace::with_test_tracing(#name, || async move #block).await
            }
        }
    } else {
        quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                ::shardlease::trace::with_test_tracing_sync(#name, || #block)
            }
        }
    })
}
