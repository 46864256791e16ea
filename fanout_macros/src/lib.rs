use proc_macro::TokenStream;
use proc_macro2::{Group, Ident, Spacing, TokenStream as TokenStream2, TokenTree};
use quote::{ToTokens, format_ident, quote};
use syn::{
    FnArg, GenericArgument, ItemFn, Lit, LitBool, LitInt, Pat, PathArguments, ReturnType, Type,
    meta::ParseNestedMeta, parse_macro_input, parse_quote, spanned::Spanned,
};

extern crate proc_macro;

/// Turns a single-item function into one that takes a batch.
///
/// ```ignore
/// #[parallel(workers = 4, rate_limit = "10/second")]
/// fn fetch(id: u64, client: Client) -> Page { ... }
///
/// // fn fetch(id: impl Into<Batch<u64>>, client: Client) -> fanout::Result<Vec<Page>>
/// let pages = fetch(vec![1, 2, 3], client)?;
/// ```
///
/// Arguments: `workers = N`, `batch_size = N`, `rate_limit = "N/unit"` (or a
/// bare number, per second), `prewarm`, and `fallible` for functions returning
/// `Result<T, E>`. Anything left out comes from the environment and the global
/// configuration. Parameters after the item are cloned into every task. On a
/// `&self` method, the receiver is cloned once per call.
#[proc_macro_attribute]
pub fn parallel(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = Args::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    parse_macro_input!(attr with parser);
    let func = parse_macro_input!(item as ItemFn);
    expand(args, func)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct Args {
    workers: Option<usize>,
    batch_size: Option<usize>,
    rate_limit: Option<String>,
    prewarm: Option<bool>,
    fallible: bool,
}

impl Args {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("workers") {
            self.workers = Some(positive(&meta)?);
        } else if meta.path.is_ident("batch_size") {
            self.batch_size = Some(positive(&meta)?);
        } else if meta.path.is_ident("rate_limit") {
            let lit: Lit = meta.value()?.parse()?;
            let spec = match &lit {
                Lit::Str(s) => s.value(),
                Lit::Int(n) => n.base10_digits().to_string(),
                Lit::Float(n) => n.base10_digits().to_string(),
                _ => {
                    return Err(syn::Error::new(
                        lit.span(),
                        "expected a rate such as \"5/second\"",
                    ));
                }
            };
            check_rate(&spec).map_err(|msg| syn::Error::new(lit.span(), msg))?;
            self.rate_limit = Some(spec);
        } else if meta.path.is_ident("prewarm") {
            self.prewarm = Some(flag(&meta)?);
        } else if meta.path.is_ident("fallible") {
            self.fallible = flag(&meta)?;
        } else {
            return Err(meta.error(
                "unsupported argument, expected workers, batch_size, rate_limit, prewarm or fallible",
            ));
        }
        Ok(())
    }
}

fn positive(meta: &ParseNestedMeta) -> syn::Result<usize> {
    let lit: LitInt = meta.value()?.parse()?;
    let n: usize = lit.base10_parse()?;
    if n == 0 {
        return Err(syn::Error::new(lit.span(), "must be at least 1"));
    }
    Ok(n)
}

fn flag(meta: &ParseNestedMeta) -> syn::Result<bool> {
    if meta.input.peek(syn::Token![=]) {
        let lit: LitBool = meta.value()?.parse()?;
        return Ok(lit.value);
    }
    Ok(true)
}

fn check_rate(spec: &str) -> Result<(), String> {
    let (count, unit) = spec.split_once('/').unwrap_or((spec, "second"));
    let count: f64 = count
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate {spec:?}"))?;
    if !count.is_finite() || count <= 0.0 {
        return Err(format!("rate must be positive, got {spec:?}"));
    }
    match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" | "m" | "min" | "minute" | "minutes" | "h" | "hr"
        | "hour" | "hours" => Ok(()),
        other => Err(format!(
            "unknown rate interval {other:?}, expected second, minute or hour"
        )),
    }
}

fn expand(args: Args, func: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;

    if let Some(token) = &sig.asyncness {
        return Err(syn::Error::new(token.span, "#[parallel] does not support async functions"));
    }
    if let Some(token) = &sig.constness {
        return Err(syn::Error::new(token.span, "#[parallel] does not support const functions"));
    }
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "#[parallel] does not support generic functions",
        ));
    }

    let mut inputs = sig.inputs.iter().peekable();
    let method = match inputs.peek() {
        Some(FnArg::Receiver(receiver)) => {
            if receiver.reference.is_none()
                || receiver.mutability.is_some()
                || receiver.colon_token.is_some()
            {
                return Err(syn::Error::new(
                    receiver.span(),
                    "#[parallel] methods must take `&self`",
                ));
            }
            inputs.next();
            true
        }
        _ => false,
    };

    let Some(FnArg::Typed(item)) = inputs.next() else {
        return Err(syn::Error::new(
            sig.ident.span(),
            "#[parallel] functions need an item parameter",
        ));
    };
    let item_pat = &item.pat;
    let item_ty = &item.ty;
    let input = match &*item.pat {
        Pat::Ident(pat) if pat.subpat.is_none() => pat.ident.clone(),
        _ => format_ident!("__fanout_input"),
    };

    let mut extra_params = Vec::new();
    let mut extra_clones = Vec::new();
    for arg in inputs {
        let FnArg::Typed(arg) = arg else {
            return Err(syn::Error::new(arg.span(), "unexpected receiver"));
        };
        let Pat::Ident(pat) = &*arg.pat else {
            return Err(syn::Error::new(
                arg.pat.span(),
                "#[parallel] extra parameters must be plain identifiers",
            ));
        };
        let ident = &pat.ident;
        let ty = &arg.ty;
        extra_params.push(quote!(#ident: #ty));
        extra_clones.push(quote!(let #pat = ::core::clone::Clone::clone(&#ident);));
    }

    let output: Type = match &sig.output {
        ReturnType::Default => parse_quote!(()),
        ReturnType::Type(_, ty) => (**ty).clone(),
    };
    let (value, run) = if args.fallible {
        (result_ok_type(&output)?, quote!(try_run))
    } else {
        (output.clone(), quote!(run))
    };

    let body = if method {
        replace_self(block.to_token_stream())
    } else {
        block.to_token_stream()
    };
    let (receiver_param, receiver_capture, receiver_bind) = if method {
        (
            quote!(&self,),
            quote!(let __fanout_receiver = ::core::clone::Clone::clone(self);),
            quote!(let __fanout_self = &__fanout_receiver;),
        )
    } else {
        (quote!(), quote!(), quote!())
    };

    let some_or_none = |value: Option<TokenStream2>| match value {
        Some(value) => quote!(::core::option::Option::Some(#value)),
        None => quote!(::core::option::Option::None),
    };
    let workers = some_or_none(args.workers.map(|n| quote!(#n)));
    let batch_size = some_or_none(args.batch_size.map(|n| quote!(#n)));
    let rate_limit = some_or_none(
        args.rate_limit
            .map(|spec| quote!(::fanout::__private::rate_limit(#spec)?)),
    );
    let prewarm = some_or_none(args.prewarm.map(|on| quote!(#on)));

    let ident = &sig.ident;
    let unsafety = &sig.unsafety;
    let abi = &sig.abi;

    Ok(quote! {
        #(#attrs)*
        #vis #unsafety #abi fn #ident(
            #receiver_param
            #input: impl ::core::convert::Into<::fanout::Batch<#item_ty>>,
            #(#extra_params),*
        ) -> ::fanout::Result<::std::vec::Vec<#value>> {
            static __FANOUT_DISPATCHER: ::fanout::__private::OnceLock<::fanout::Dispatcher> =
                ::fanout::__private::OnceLock::new();
            let __fanout_dispatcher = ::fanout::__private::dispatcher(
                &__FANOUT_DISPATCHER,
                || -> ::fanout::Result<::fanout::Options> {
                    ::core::result::Result::Ok(::fanout::Options {
                        workers: #workers,
                        batch_size: #batch_size,
                        executor: ::core::option::Option::Some(::fanout::ExecutorKind::Thread),
                        rate_limit: #rate_limit,
                        prewarm: #prewarm,
                    })
                },
            )?;
            #receiver_capture
            __fanout_dispatcher.#run(#input, move |#item_pat: #item_ty| -> #output {
                #receiver_bind
                #(#extra_clones)*
                #body
            })
        }
    })
}

/// `T` out of `Result<T, E>` (or any `...::Result<T, ...>` alias).
fn result_ok_type(ty: &Type) -> syn::Result<Type> {
    let error = || {
        syn::Error::new(
            ty.span(),
            "#[parallel(fallible)] functions must return Result<T, E>",
        )
    };
    let Type::Path(path) = ty else {
        return Err(error());
    };
    let segment = path.path.segments.last().ok_or_else(error)?;
    if segment.ident != "Result" {
        return Err(error());
    }
    let PathArguments::AngleBracketed(generics) = &segment.arguments else {
        return Err(error());
    };
    match generics.args.first() {
        Some(GenericArgument::Type(ok)) => Ok(ok.clone()),
        _ => Err(error()),
    }
}

/// Renames every `self` value in a method body, so the body can run inside a
/// closure that holds a clone of the receiver. `self::` paths are left alone.
fn replace_self(tokens: TokenStream2) -> TokenStream2 {
    let mut out = Vec::new();
    let mut tokens = tokens.into_iter().peekable();
    while let Some(token) = tokens.next() {
        out.push(match token {
            TokenTree::Ident(ident) if ident == "self" && !starts_path(tokens.peek()) => {
                TokenTree::Ident(Ident::new("__fanout_self", ident.span()))
            }
            TokenTree::Group(group) => {
                let mut replaced = Group::new(group.delimiter(), replace_self(group.stream()));
                replaced.set_span(group.span());
                TokenTree::Group(replaced)
            }
            other => other,
        });
    }
    out.into_iter().collect()
}

fn starts_path(next: Option<&TokenTree>) -> bool {
    matches!(next, Some(TokenTree::Punct(p)) if p.as_char() == ':' && p.spacing() == Spacing::Joint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand_str(attr: TokenStream2, item: TokenStream2) -> syn::Result<String> {
        let mut args = Args::default();
        let parser = syn::meta::parser(|meta| args.parse(meta));
        syn::parse::Parser::parse2(parser, attr)?;
        expand(args, syn::parse2(item)?).map(|tokens| tokens.to_string())
    }

    #[test]
    fn rates_are_checked_at_compile_time() {
        assert!(check_rate("5/second").is_ok());
        assert!(check_rate("100 / min").is_ok());
        assert!(check_rate("2.5").is_ok());
        assert!(check_rate("0/second").is_err());
        assert!(check_rate("five/second").is_err());
        assert!(check_rate("5/fortnight").is_err());
    }

    #[test]
    fn result_types_are_unwrapped() {
        let ok = result_ok_type(&parse_quote!(Result<u32, String>)).unwrap();
        assert_eq!(ok.to_token_stream().to_string(), "u32");
        let ok = result_ok_type(&parse_quote!(std::io::Result<Vec<u8>>)).unwrap();
        assert_eq!(ok.to_token_stream().to_string(), "Vec < u8 >");
        assert!(result_ok_type(&parse_quote!(Option<u32>)).is_err());
    }

    #[test]
    fn self_is_renamed_everywhere() {
        let replaced = replace_self(quote!({ self.a + (self.b)[0] }));
        let text = replaced.to_string();
        assert_eq!(text.matches("__fanout_self").count(), 2);
        assert!(!text.replace("__fanout_self", "").contains("self"));
    }

    #[test]
    fn self_paths_are_not_renamed() {
        let replaced = replace_self(quote!({ self::helpers::scale(self.factor, x) }));
        let text = replaced.to_string().replace(' ', "");
        assert!(text.contains("self::helpers::scale(__fanout_self.factor,x)"), "{text}");
    }

    #[test]
    fn free_functions_take_a_batch() {
        let out = expand_str(
            quote!(workers = 4, rate_limit = "5/second"),
            quote!(fn double(x: u32, factor: u32) -> u32 { x * factor }),
        )
        .unwrap()
        .replace(' ', "");
        assert!(out.contains("fndouble(x:impl::core::convert::Into<::fanout::Batch<u32>>,factor:u32)"));
        assert!(out.contains("Some(4usize)"));
        assert!(out.contains("rate_limit(\"5/second\")"));
        assert!(out.contains(".run(x,move|x:u32|->u32{"));
        assert!(out.contains("letfactor=::core::clone::Clone::clone(&factor);"));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let item = quote!(fn f(x: u32) -> u32 { x });
        for attr in [
            quote!(workers = 0),
            quote!(rate_limit = "fast"),
            quote!(threads = 2),
            quote!(fallible),
        ] {
            assert!(expand_str(attr.clone(), item.clone()).is_err(), "{attr}");
        }
    }

    #[test]
    fn unsupported_signatures_are_rejected() {
        for item in [
            quote!(fn f<T>(x: T) -> T { x }),
            quote!(async fn f(x: u32) -> u32 { x }),
            quote!(fn f(self, x: u32) -> u32 { x }),
            quote!(fn f(&mut self, x: u32) -> u32 { x }),
            quote!(fn f() -> u32 { 1 }),
            quote!(fn f(x: u32, (a, b): (u8, u8)) -> u32 { x }),
        ] {
            assert!(expand_str(quote!(), item.clone()).is_err(), "{item}");
        }
    }
}
