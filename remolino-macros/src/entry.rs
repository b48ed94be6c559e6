use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

/// Fallback used when the attribute arguments fail to parse, so the item
/// still expands into something close to the expected output and IDE
/// features keep working next to the error.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    flavor: RuntimeFlavor::Pool,
    worker_threads: None,
};

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, false))
    };

    match config {
        Ok(config) => parse_knobs(input, false, config),
        Err(e) => token_stream_with_error(parse_knobs(input, false, DEFAULT_ERROR_CONFIG), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };
    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => parse_knobs(input, true, config),
        Err(e) => token_stream_with_error(parse_knobs(input, true, DEFAULT_ERROR_CONFIG), e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RuntimeFlavor {
    Local,
    Pool,
}

impl RuntimeFlavor {
    fn from_str(s: &str) -> Result<RuntimeFlavor, String> {
        match s {
            "local" => Ok(RuntimeFlavor::Local),
            "pool" => Ok(RuntimeFlavor::Pool),
            _ => Err(format!(
                "No such runtime flavor `{s}`. The runtime flavors are `local` and `pool`."
            )),
        }
    }
}

struct FinalConfig {
    flavor: RuntimeFlavor,
    worker_threads: Option<usize>,
}

struct ConfigBuilder {
    default_flavor: RuntimeFlavor,
    flavor: Option<RuntimeFlavor>,
    worker_threads: Option<(usize, Span)>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            default_flavor: match is_test {
                true => RuntimeFlavor::Local,
                false => RuntimeFlavor::Pool,
            },
            flavor: None,
            worker_threads: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "remolino::test"
        } else {
            "remolino::main"
        }
    }

    fn set_flavor(&mut self, runtime: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.flavor.is_some() {
            return Err(syn::Error::new(span, "`flavor` set multiple times."));
        }

        let runtime_str = parse_string(runtime, span, "flavor")?;
        let runtime =
            RuntimeFlavor::from_str(&runtime_str).map_err(|err| syn::Error::new(span, err))?;
        self.flavor = Some(runtime);

        Ok(())
    }

    fn set_worker_threads(
        &mut self,
        worker_threads: syn::Lit,
        span: Span,
    ) -> Result<(), syn::Error> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = parse_int(worker_threads, span, "worker_threads")?;
        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some((worker_threads, span));

        Ok(())
    }

    fn build(&self) -> Result<FinalConfig, syn::Error> {
        let flavor = self.flavor.unwrap_or(self.default_flavor);

        let worker_threads = match (flavor, self.worker_threads) {
            (RuntimeFlavor::Local, Some((_, worker_threads_span))) => {
                let msg = format!(
                    "The `worker_threads` option requires the `pool` runtime flavor. Use `#[{}(flavor = \"pool\")]`",
                    self.macro_name(),
                );
                return Err(syn::Error::new(worker_threads_span, msg));
            }
            (RuntimeFlavor::Pool, Some((worker_threads, _))) => Some(worker_threads),
            (_, None) => None,
        };

        Ok(FinalConfig {
            flavor,
            worker_threads,
        })
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    let mut config = ConfigBuilder::new(is_test);
    let macro_name = config.macro_name();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => {
                        config.set_worker_threads(lit.clone(), syn::spanned::Spanned::span(lit))?;
                    }
                    "flavor" => {
                        config.set_flavor(lit.clone(), syn::spanned::Spanned::span(lit))?;
                    }
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: `flavor`, `worker_threads`",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "flavor" | "worker_threads" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => {
                        format!(
                            "Unknown attribute {name} is specified; expected one of: `flavor`, `worker_threads`. Set the flavor with #[{macro_name}(flavor = \"local\")]."
                        )
                    }
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn parse_knobs(mut input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    input.sig.asyncness = None;

    // If a type mismatch occurs, the current rustc points to the last
    // statement; borrow its spans so the error lands on the user's code.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();
        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let mut rt = match config.flavor {
        RuntimeFlavor::Local => {
            quote_spanned! {last_stmt_start_span=>
                remolino::runtime::Builder::new_local()
            }
        }
        RuntimeFlavor::Pool => quote_spanned! {last_stmt_start_span=>
            remolino::runtime::Builder::new_pool()
        },
    };

    if let Some(v) = config.worker_threads {
        rt = quote_spanned! {last_stmt_start_span=> #rt.worker_threads(#v) };
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let body = input.body();

    // The runtime is built, and the root handle bound, *before* the async
    // body is constructed: there is no thread-local lookup, so `handle` is
    // the body's only way to reach its loop.
    //
    // For test functions the body is pinned to the stack and driven as
    // `Pin<&mut dyn Future>`, which keeps the number of monomorphized
    // `block_on` copies down across a large test suite.
    let body = if is_test {
        let output_type = match &input.sig.output {
            // For functions with no return value syn doesn't print
            // anything, but that doesn't work as `Output` for our dyn
            // `Future`, so default to `()`.
            syn::ReturnType::Default => quote! { () },
            syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
        };
        quote! {
            let __runtime = #rt
                .try_build()
                .expect("Failed building the Runtime");
            #[allow(unused_variables)]
            let handle = __runtime.handle().clone();
            let mut unpinned = async #body;
            let pinned = std::pin::pin!(unpinned);
            let body: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output_type>> = pinned;
        }
    } else {
        quote! {
            let __runtime = #rt
                .try_build()
                .expect("Failed building the Runtime");
            #[allow(unused_variables)]
            let handle = __runtime.handle().clone();
            let body = async #body;
        }
    };

    // This explicit `return` keeps the output type honest even when the
    // user's last statement diverges.
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::diverging_sub_expression, clippy::needless_return)]
        {
            return __runtime.block_on(body);
        }
    };

    input.into_tokens(generated_attrs, body, last_block)
}
