//! Attribute macro for corrigo module constructors.
//!
//! The module registry stores constructors as plain `fn` pointers returning
//! a pinned boxed future (`corrigo::config::Callback`), which rules out the
//! natural signature `fn(ModuleContext) -> Result<Box<dyn Module>, Error>`.
//! Annotating a constructor with `#[corrigo_registration_func]` rewrites it
//! in place: the body moves into a `Box::pin(async move { .. })` and the
//! return type becomes the pinned future the registry expects. The
//! annotated function must itself be synchronous.
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

#[proc_macro_attribute]
pub fn corrigo_registration_func(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let constructor = parse_macro_input!(input as ItemFn);
    if let Some(asyncness) = &constructor.sig.asyncness {
        return syn::Error::new_spanned(
            asyncness,
            "module constructors are synchronous; the attribute adds the future wrapper",
        )
        .to_compile_error()
        .into();
    }

    let vis = &constructor.vis;
    let name = &constructor.sig.ident;
    let args = &constructor.sig.inputs;
    let body = &constructor.block;
    let output = match &constructor.sig.output {
        syn::ReturnType::Type(_, ty) => quote! { #ty },
        syn::ReturnType::Default => quote! { () },
    };
    let future = quote! {
        std::pin::Pin<Box<dyn core::future::Future<Output = #output> + Send>>
    };

    quote! {
        #vis fn #name(#args) -> #future {
            Box::pin(async move {
                let __corrigo_registration_result: #output = #body;
                __corrigo_registration_result
            })
        }
    }
    .into()
}
