//! Derive macros for the `Trace` and `GarbageCollected` traits.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Fields,
    GenericParam, Generics, Ident, Index, Path,
};

/// Options accepted through `#[cogc(...)]`.
struct ContainerOptions {
    krate: Path,
    polymorphic: bool,
    externally_managed: bool,
}

impl ContainerOptions {
    fn from_attrs(attrs: &[Attribute]) -> Result<Self, syn::Error> {
        let mut options = Self {
            krate: parse_quote!(::cogc),
            polymorphic: false,
            externally_managed: false,
        };

        for attr in attrs {
            if !attr.path().is_ident("cogc") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    options.krate = meta.value()?.parse()?;
                    Ok(())
                } else if meta.path.is_ident("polymorphic") {
                    options.polymorphic = true;
                    Ok(())
                } else if meta.path.is_ident("externally_managed") {
                    options.externally_managed = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported attribute"))
                }
            })?;
        }

        Ok(options)
    }
}

#[proc_macro_derive(Trace, attributes(cogc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let options = match ContainerOptions::from_attrs(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.into_compile_error().into(),
    };
    let cogc = &options.krate;

    let name = &input.ident;
    let generics = add_trait_bounds(cogc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = generate_trace_body(cogc, name, &input.data);

    let generated = quote! {
        unsafe impl #impl_generics #cogc::Trace for #name #ty_generics #where_clause {
            #[inline]
            fn trace(&self, visitor: &mut dyn #cogc::Visitor) {
                #trace_body
            }
        }
    };

    generated.into()
}

/// Implements `GarbageCollected`.
///
/// Non-generic types get a dedicated static index slot. Generic types fall
/// back to the per-`TypeId` slot registry of the runtime crate.
#[proc_macro_derive(GarbageCollected, attributes(cogc))]
pub fn derive_garbage_collected(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let options = match ContainerOptions::from_attrs(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.into_compile_error().into(),
    };
    let cogc = &options.krate;

    let name = &input.ident;
    let is_generic = input.generics.type_params().next().is_some()
        || input.generics.lifetimes().next().is_some()
        || input.generics.const_params().next().is_some();
    let generics = add_trait_bounds(cogc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let slot = if is_generic {
        quote! {}
    } else {
        quote! {
            #[inline]
            fn gc_info_slot() -> &'static #cogc::GcInfoIndexSlot {
                static SLOT: #cogc::GcInfoIndexSlot = #cogc::GcInfoIndexSlot::new();
                &SLOT
            }
        }
    };

    let polymorphic = if options.polymorphic {
        quote! { const HAS_VTABLE: bool = true; }
    } else {
        quote! {}
    };

    let externally_managed = if options.externally_managed {
        quote! { const IS_EXTERNALLY_MANAGED: bool = true; }
    } else {
        quote! {}
    };

    let generated = quote! {
        impl #impl_generics #cogc::GarbageCollected for #name #ty_generics #where_clause {
            #polymorphic
            #externally_managed
            #slot
        }
    };

    generated.into()
}

fn add_trait_bounds(cogc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });
            let has_bound = |name: &str| {
                type_param.bounds.iter().any(|b| {
                    if let syn::TypeParamBound::Trait(t) = b {
                        t.path.segments.last().is_some_and(|s| s.ident == name)
                    } else {
                        false
                    }
                })
            };
            let has_send = has_bound("Send");
            let has_sync = has_bound("Sync");
            let has_static = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Lifetime(l) = b {
                    l.ident == "static"
                } else {
                    false
                }
            });

            if !has_trace {
                type_param.bounds.push(parse_quote!(#cogc::Trace));
            }
            if !has_send {
                type_param.bounds.push(parse_quote!(::core::marker::Send));
            }
            if !has_sync {
                type_param.bounds.push(parse_quote!(::core::marker::Sync));
            }
            if !has_static {
                type_param.bounds.push(parse_quote!('static));
            }
        }
    }
    generics
}

fn generate_trace_body(cogc: &Path, name: &Ident, data: &Data) -> TokenStream {
    match data {
        Data::Struct(data) => generate_struct_trace(cogc, &data.fields),
        Data::Enum(data) => generate_enum_trace(cogc, name, data),
        Data::Union(u) => {
            quote_spanned! {
                u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
            }
        }
    }
}

fn generate_struct_trace(cogc: &Path, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(f) => {
            let trace_calls = f.named.iter().map(|field| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #cogc::Trace::trace(&self.#name, visitor);
                }
            });
            quote! { #(#trace_calls)* }
        }
        Fields::Unnamed(f) => {
            let trace_calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #cogc::Trace::trace(&self.#index, visitor);
                }
            });
            quote! { #(#trace_calls)* }
        }
        Fields::Unit => quote! { let _ = visitor; },
    }
}

fn generate_enum_trace(cogc: &Path, name: &Ident, data: &syn::DataEnum) -> TokenStream {
    let match_arms = data.variants.iter().map(|variant| {
        let var_name = &variant.ident;
        match &variant.fields {
            Fields::Named(f) => {
                let bindings: Vec<_> = (0..f.named.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let field_idents = f.named.iter().map(|f| &f.ident);
                let trace_calls = bindings.iter().map(|field| {
                    quote! { #cogc::Trace::trace(#field, visitor); }
                });

                quote! {
                    #name::#var_name { #(#field_idents: #bindings),* } => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let bindings: Vec<_> = (0..f.unnamed.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let trace_calls = bindings.iter().map(|field| {
                    quote! { #cogc::Trace::trace(#field, visitor); }
                });

                quote! {
                    #name::#var_name(#(#bindings),*) => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unit => {
                quote! {
                    #name::#var_name => {}
                }
            }
        }
    });

    quote! {
        let _ = visitor;
        match self {
            #(#match_arms)*
        }
    }
}
