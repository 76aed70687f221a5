use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by `#[tokio_timeout_test]`:
///
/// - `#[tokio_timeout_test]`
/// - `#[tokio_timeout_test(10)]`
/// - `#[tokio_timeout_test(secs = 10, start_paused)]`
struct TimeoutArgs {
    secs: u64,
    start_paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                args.secs = parse_secs(&input.parse()?)?;
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "secs" => {
                        input.parse::<Token![=]>()?;
                        args.secs = parse_secs(&input.parse()?)?;
                    }
                    "start_paused" => args.start_paused = true,
                    other => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!("unknown tokio_timeout_test argument `{other}`"),
                        ));
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs an async test on a current-thread runtime in its own thread and
/// fails it once the wall-clock timeout elapses.
///
/// With `start_paused` the runtime clock starts paused, so backoff and
/// heartbeat timers auto-advance; only the wall-clock guard applies then.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let start_paused = args.start_paused;
    let body = if start_paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(#start_paused)
                        .build()
                        .expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
