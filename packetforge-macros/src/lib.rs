//! `#[handler(...)]`: the codegen equivalent of runtime reflection for
//! dispatcher registration. Annotating an async handler function emits, next
//! to it, a `<name>_descriptor()` function building the immutable
//! `HandlerDescriptor` the dispatcher indexes by `command_id`.
//!
//! Expected handler signature: `async fn name(packet: Packet, conn: Arc<Connection>) -> Option<Packet>`.
//! Generated code refers to the dispatcher/connection types through the
//! absolute `packetforge_net::` path rather than `crate::`, so the attribute
//! works equally from inside `packetforge-net`'s own controllers and from a
//! downstream crate such as `packetforge-demo` registering an application
//! handler. `packetforge-net`'s `lib.rs` declares `extern crate self as
//! packetforge_net;` so that path resolves there too.
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Expr, ItemFn, MetaNameValue, Token};

struct HandlerArgs {
    id: Expr,
    permission: syn::Ident,
    timeout_ms: Expr,
    encryption_required: Expr,
    rate_group: Option<Expr>,
    max_requests: Expr,
    window_ms: Expr,
}

fn parse_args(attr: TokenStream) -> HandlerArgs {
    let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated
        .parse(attr)
        .expect("#[handler(...)] expects `key = value` pairs");

    let mut id = None;
    let mut permission = None;
    let mut timeout_ms: Expr = syn::parse_quote!(0u32);
    let mut encryption_required: Expr = syn::parse_quote!(false);
    let mut rate_group = None;
    let mut max_requests: Expr = syn::parse_quote!(0u32);
    let mut window_ms: Expr = syn::parse_quote!(0u64);

    for pair in pairs {
        let key = pair
            .path
            .get_ident()
            .unwrap_or_else(|| panic!("handler attribute keys must be plain identifiers"))
            .to_string();

        match key.as_str() {
            "id" => id = Some(pair.value),
            "permission" => {
                let ident = match &pair.value {
                    Expr::Path(p) => p.path.get_ident().cloned().expect("permission must be a bare identifier"),
                    _ => panic!("permission must be one of Guest, User, Admin, Owner"),
                };
                permission = Some(ident);
            }
            "timeout_ms" => timeout_ms = pair.value,
            "encryption_required" => encryption_required = pair.value,
            "rate_group" => rate_group = Some(pair.value),
            "max_requests" => max_requests = pair.value,
            "window_ms" => window_ms = pair.value,
            other => panic!("unknown #[handler] key `{other}`"),
        }
    }

    HandlerArgs {
        id: id.expect("#[handler] requires `id = <command id>`"),
        permission: permission.expect("#[handler] requires `permission = <PermissionLevel variant>`"),
        timeout_ms,
        encryption_required,
        rate_group,
        max_requests,
        window_ms,
    }
}

fn rate_limit_tokens(args: &HandlerArgs) -> TokenStream2 {
    match &args.rate_group {
        Some(group) => {
            let max_requests = &args.max_requests;
            let window_ms = &args.window_ms;
            quote! {
                Some(packetforge_net::dispatcher::RateLimitSpec {
                    group: #group,
                    max_requests: #max_requests,
                    window_ms: #window_ms,
                })
            }
        }
        None => quote! { None },
    }
}

/// Generates a `<name>_descriptor() -> packetforge_net::dispatcher::HandlerDescriptor`
/// next to the annotated handler. The handler body is left untouched.
#[proc_macro_attribute]
pub fn handler(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_args(attr);
    let func = parse_macro_input!(item as ItemFn);

    let fn_name = func.sig.ident.clone();
    let descriptor_fn = format_ident!("{}_descriptor", fn_name);
    let wrapper_fn = format_ident!("{}_wrapper", fn_name);

    let HandlerArgs {
        id,
        permission,
        timeout_ms,
        encryption_required,
        ..
    } = &args;
    let rate_limit = rate_limit_tokens(&args);

    let expanded = quote! {
        #func

        fn #wrapper_fn(
            packet: packetforge_core::packet::Packet,
            conn: std::sync::Arc<packetforge_net::connection::Connection>,
        ) -> packetforge_net::dispatcher::HandlerFuture {
            Box::pin(#fn_name(packet, conn))
        }

        pub fn #descriptor_fn() -> packetforge_net::dispatcher::HandlerDescriptor {
            packetforge_net::dispatcher::HandlerDescriptor {
                command_id: #id,
                required_permission: packetforge_core::packet::PermissionLevel::#permission,
                timeout_ms: #timeout_ms,
                encryption_required: #encryption_required,
                rate_limit: #rate_limit,
                callable: #wrapper_fn,
            }
        }
    };

    expanded.into()
}
