use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// `#[textract_quota::test]` runs a test inside a span named after the test,
/// with the crate's tracing subscriber installed, so controller logs show up
/// next to the failing assertion.
///
/// An `async fn` becomes a `#[tokio::test]`, and anything written inside the
/// parentheses is handed to it unchanged. Controller tests rely on this for
/// a paused runtime clock:
///
/// ```ignore
/// #[textract_quota::test(start_paused = true)]
/// async fn retries_after_backoff() { /* virtual time */ }
/// ```
///
/// A plain `fn` becomes a `#[test]`. It has no runtime to configure, so
/// arguments on a sync test are a compile error rather than silently dropped.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let runtime_args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let body = &input.block;
    let test_name = &sig.ident;

    if sig.asyncness.is_none() {
        if !runtime_args.is_empty() {
            return syn::Error::new_spanned(
                runtime_args,
                "runtime arguments only apply to async tests",
            )
            .to_compile_error()
            .into();
        }
        return quote! {
            #[test]
            #vis #sig {
                textract_quota::trace::with_test_tracing_sync(stringify!(#test_name), || #body)
            }
        }
        .into();
    }

    let tokio_attr = if runtime_args.is_empty() {
        quote! { #[tokio::test] }
    } else {
        quote! { #[tokio::test(#runtime_args)] }
    };
    quote! {
        #tokio_attr
        #vis #sig {
            textract_quota::trace::with_test_tracing(stringify!(#test_name), || async move #body).await
        }
    }
    .into()
}
