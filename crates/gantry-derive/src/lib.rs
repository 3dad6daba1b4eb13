//! Provides derive macros for `gantry::HasDependencies`.
use std::collections::HashSet;

use quote::quote;
use syn::{Data, DataStruct, DeriveInput, Field, Fields, FieldsNamed};

/// Returns the named fields that participate in dependency tracking.
///
/// Fields annotated `#[gantry(ignore)]` are skipped.
fn get_tracked_fields(input: &DeriveInput) -> syn::Result<Vec<&Field>> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(DataStruct {
            fields: Fields::Named(FieldsNamed { named, .. }),
            ..
        }) => named,
        _ => {
            return Err(syn::Error::new(
                name.span(),
                "deriving HasDependencies only supports structs with named fields".to_string(),
            ));
        }
    };

    let mut tracked = vec![];
    'outer: for field in fields.iter() {
        for att in field.attrs.iter() {
            let mut ignore = false;
            if att.path().is_ident("gantry") {
                att.parse_nested_meta(|meta| {
                    if meta.path.is_ident("ignore") {
                        ignore = true;
                        Ok(())
                    } else {
                        Err(meta.error(format!(
                            "unsupported field attribute {:?} - must be 'ignore'",
                            meta.path
                                .get_ident()
                                .map(|id| id.to_string())
                                .unwrap_or("unknown".to_string())
                        )))
                    }
                })?;
            }
            if ignore {
                continue 'outer;
            }
        }
        tracked.push(field);
    }
    Ok(tracked)
}

#[proc_macro_derive(HasDependencies, attributes(gantry))]
pub fn derive_has_dependencies(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input: DeriveInput = syn::parse_macro_input!(input);
    let name = &input.ident;

    let fields = match get_tracked_fields(&input) {
        Ok(fields) => fields,
        Err(e) => return e.into_compile_error().into(),
    };

    let where_constraints: Vec<_> = fields
        .iter()
        .map(|field| &field.ty)
        .collect::<HashSet<_>>()
        .into_iter()
        .map(|ty| {
            quote! {
                #ty: gantry::HasDependencies
            }
        })
        .collect();
    let merges: Vec<_> = fields
        .iter()
        .map(|field| {
            // UNWRAP: safe because we only track named fields
            let ident = field.ident.clone().unwrap();
            quote! {
                let deps = deps.merge(gantry::HasDependencies::dependencies(&self.#ident));
            }
        })
        .collect();

    let output = quote! {
        impl gantry::HasDependencies for #name
        where
            #(#where_constraints),*
        {
            fn dependencies(&self) -> gantry::Dependencies {
                let deps = gantry::Dependencies::default();
                #(#merges)*
                deps
            }
        }
    };
    output.into()
}

/// Implements `HasDependencies` for a tuple of `HasDependencies` types.
///
/// ```ignore
/// impl_has_dependencies_tuples!((A, B, C));
/// ```
#[proc_macro]
pub fn impl_has_dependencies_tuples(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let tuple: syn::TypeTuple = syn::parse_macro_input!(input);
    let params: Vec<syn::Type> = tuple.elems.iter().cloned().collect();
    let indices: Vec<syn::Index> = (0..params.len()).map(syn::Index::from).collect();

    let output = quote! {
        impl<#(#params: gantry::HasDependencies),*> gantry::HasDependencies for (#(#params,)*) {
            fn dependencies(&self) -> gantry::Dependencies {
                let deps = gantry::Dependencies::default();
                #(let deps = deps.merge(gantry::HasDependencies::dependencies(&self.#indices));)*
                deps
            }
        }
    };
    output.into()
}
