//! Procedural macros for the Quill scripting engine.
//!
//! This crate provides the `#[host_fn]` attribute macro for defining host
//! functions with automatic argument conversion and documentation
//! generation.
//!
//! # Example
//!
//! ```ignore
//! use quill_macros::host_fn;
//! use quill::Value;
//!
//! /// Get current weather for a city.
//! ///
//! /// Args:
//! ///     city: The city name to look up
//! ///     unit: Temperature unit (celsius or fahrenheit)
//! #[host_fn]
//! fn fetch_weather(city: String, unit: Option<String>) -> Value {
//!     Value::str(format!("{}: 22C", city))
//! }
//!
//! // Register with an engine
//! engine.add(fetch_weather::HostFn);
//! ```

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use std::collections::HashMap;
use syn::{
    Attribute, Expr, FnArg, ItemFn, Lit, LitStr, Meta, Pat, PatType, ReturnType, Token, Type,
    parse::{Parse, ParseStream},
    parse_macro_input,
};

/// Parsed arguments for the `#[host_fn(...)]` attribute.
struct HostFnArgs {
    description: Option<String>,
}

impl Parse for HostFnArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut description = None;

        while !input.is_empty() {
            let ident: syn::Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            if ident == "description" {
                let lit: LitStr = input.parse()?;
                description = Some(lit.value());
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(HostFnArgs { description })
    }
}

/// Parsed documentation from doc comments.
struct ParsedDocs {
    /// The main description (everything before the Args: section).
    description: String,
    /// Argument descriptions from the Args: section.
    args: HashMap<String, String>,
}

/// Parse doc comments to extract the description and per-argument notes.
///
/// Expected format:
/// ```text
/// /// Main description here.
/// ///
/// /// Args:
/// ///     param1: Description of param1
/// ///     param2: Description of param2
/// ```
fn parse_doc_comments(attrs: &[Attribute]) -> ParsedDocs {
    let mut lines: Vec<String> = Vec::new();

    for attr in attrs {
        if attr.path().is_ident("doc")
            && let Meta::NameValue(meta) = &attr.meta
            && let Expr::Lit(expr_lit) = &meta.value
            && let Lit::Str(lit_str) = &expr_lit.lit
        {
            lines.push(lit_str.value());
        }
    }

    let mut description_lines: Vec<String> = Vec::new();
    let mut args: HashMap<String, String> = HashMap::new();
    let mut in_args_section = false;
    let mut current_arg: Option<(String, String)> = None;

    for line in lines {
        let trimmed = line.trim();

        if trimmed == "Args:" || trimmed == "Arguments:" {
            in_args_section = true;
            if let Some((name, desc)) = current_arg.take() {
                args.insert(name, desc.trim().to_string());
            }
            continue;
        }

        if in_args_section {
            if let Some(colon_pos) = trimmed.find(':') {
                let potential_name = trimmed[..colon_pos].trim();
                // Valid arg names are single words without spaces.
                if !potential_name.is_empty() && !potential_name.contains(' ') {
                    if let Some((name, desc)) = current_arg.take() {
                        args.insert(name, desc.trim().to_string());
                    }
                    let desc = trimmed[colon_pos + 1..].trim().to_string();
                    current_arg = Some((potential_name.to_string(), desc));
                    continue;
                }
            }

            // Continuation of the previous arg description.
            if let Some((_, ref mut desc)) = current_arg
                && !trimmed.is_empty()
            {
                desc.push(' ');
                desc.push_str(trimmed);
            }
        } else if !trimmed.is_empty() {
            description_lines.push(trimmed.to_string());
        }
    }

    if let Some((name, desc)) = current_arg {
        args.insert(name, desc.trim().to_string());
    }

    let description = description_lines.join(" ");

    ParsedDocs { description, args }
}

/// Map a Rust parameter type to a script type name.
fn rust_type_to_script(ty: &Type) -> String {
    let ty_str = quote!(#ty).to_string().replace(" ", "");

    fn base(name: &str) -> &'static str {
        match name {
            "String" | "&str" => "string",
            "i64" | "i32" | "i16" | "i8" | "isize" => "int",
            "u64" | "u32" | "u16" | "u8" | "usize" => "uint",
            "f64" | "f32" => "float",
            "bool" => "bool",
            "char" => "char",
            "()" => "nil",
            _ => "any",
        }
    }

    match ty_str.as_str() {
        _ if ty_str.starts_with("Option<") => {
            base(&ty_str[7..ty_str.len() - 1]).to_string()
        }
        _ if ty_str.starts_with("Vec<") => {
            format!("array[{}]", base(&ty_str[4..ty_str.len() - 1]))
        }
        "Value" | "quill::Value" => "any".to_string(),
        other => base(other).to_string(),
    }
}

/// Check if a type is `Option<T>`.
fn is_option_type(ty: &Type) -> bool {
    let ty_str = quote!(#ty).to_string().replace(" ", "");
    ty_str.starts_with("Option<")
}

/// The `#[host_fn]` attribute macro for defining host functions.
///
/// Transforms a plain Rust function into a host callable with automatic:
/// - argument conversion from [`Value`] via `FromValue`
/// - error raising on missing or mistyped arguments
/// - documentation generation for `Engine::describe`
///
/// # Generated code
///
/// The macro generates a module named after the function containing:
/// - `INFO`: static `HostFnInfo` metadata
/// - `call`: `fn(Vec<Value>) -> Result<Value, ErrorValue>`
/// - `HostFn`: unit struct implementing `quill::HostFn`
///
/// # Registration
///
/// ```ignore
/// // Ergonomic
/// engine.add(add::HostFn);
///
/// // Explicit
/// engine.register_host_fn(add::INFO.clone(), |ctx| add::call(ctx.args.clone()));
/// ```
#[proc_macro_attribute]
pub fn host_fn(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as HostFnArgs);
    let input_fn = parse_macro_input!(item as ItemFn);

    let parsed_docs = parse_doc_comments(&input_fn.attrs);
    let description = args
        .description
        .unwrap_or_else(|| parsed_docs.description.clone());

    let fn_name = &input_fn.sig.ident;
    let fn_name_str = fn_name.to_string();
    let mod_name = format_ident!("{}", fn_name);

    let mut arg_infos = Vec::new();
    let mut arg_names = Vec::new();
    let mut arg_conversions = Vec::new();

    for (i, arg) in input_fn.sig.inputs.iter().enumerate() {
        if let FnArg::Typed(PatType { pat, ty, .. }) = arg
            && let Pat::Ident(pat_ident) = pat.as_ref()
        {
            let arg_name = &pat_ident.ident;
            let arg_name_str = arg_name.to_string();
            let script_type = rust_type_to_script(ty);
            let is_optional = is_option_type(ty);
            let doc = parsed_docs
                .args
                .get(&arg_name_str)
                .cloned()
                .unwrap_or_default();

            arg_names.push(arg_name.clone());

            if is_optional {
                arg_infos.push(quote! {
                    .arg_opt(#arg_name_str, #script_type, #doc)
                });
            } else {
                arg_infos.push(quote! {
                    .arg(#arg_name_str, #script_type, #doc)
                });
            }

            let idx = i;
            if is_optional {
                arg_conversions.push(quote! {
                    let #arg_name: #ty = match args.get(#idx) {
                        Some(v) => <#ty as quill::FromValue>::from_value(v)
                            .map_err(|e| quill::HostCallError::bad_argument(#arg_name_str, e))?,
                        None => None,
                    };
                });
            } else {
                arg_conversions.push(quote! {
                    let #arg_name: #ty = match args.get(#idx) {
                        Some(v) => <#ty as quill::FromValue>::from_value(v)
                            .map_err(|e| quill::HostCallError::bad_argument(#arg_name_str, e))?,
                        None => {
                            return Err(quill::HostCallError::missing_argument(#arg_name_str));
                        }
                    };
                });
            }
        }
    }

    let return_script_type = match &input_fn.sig.output {
        ReturnType::Default => "nil".to_string(),
        ReturnType::Type(_, ty) => rust_type_to_script(ty),
    };

    let fn_vis = &input_fn.vis;
    let fn_block = &input_fn.block;
    let fn_output = &input_fn.sig.output;

    let clean_inputs: Vec<_> = input_fn
        .sig
        .inputs
        .iter()
        .map(|arg| {
            if let FnArg::Typed(pat_type) = arg {
                let pat = &pat_type.pat;
                let ty = &pat_type.ty;
                quote! { #pat: #ty }
            } else {
                quote! { #arg }
            }
        })
        .collect();

    let expanded = quote! {
        #fn_vis mod #mod_name {
            use super::*;

            /// Host function metadata for registration.
            pub static INFO: std::sync::LazyLock<quill::HostFnInfo> =
                std::sync::LazyLock::new(|| {
                    quill::HostFnInfo::new(#fn_name_str, #description)
                        #(#arg_infos)*
                        .returns(#return_script_type)
                });

            /// The actual implementation.
            fn implementation(#(#clean_inputs),*) #fn_output #fn_block

            /// Wrapper that converts arguments and raises conversion
            /// failures as script errors.
            pub fn call(args: Vec<quill::Value>) -> Result<quill::Value, quill::ErrorValue> {
                try_call(args).map_err(quill::ErrorValue::from)
            }

            fn try_call(
                args: Vec<quill::Value>,
            ) -> Result<quill::Value, quill::HostCallError> {
                #(#arg_conversions)*

                let result = implementation(#(#arg_names),*);
                Ok(result.into())
            }

            /// Unit struct for ergonomic registration with
            /// `engine.add(name::HostFn)`.
            pub struct HostFn;

            impl quill::HostFn for HostFn {
                fn info() -> &'static quill::HostFnInfo {
                    &*INFO
                }

                fn call(args: Vec<quill::Value>) -> Result<quill::Value, quill::ErrorValue> {
                    call(args)
                }
            }
        }
    };

    TokenStream::from(expanded)
}
