//! A derive macro for the `RemoteExecute` trait.
//!
//! Workers receive tasks that name an operation rather than point to it. This
//! macro gives each operation a name and registers a type-erased entry point
//! under that name in a [`linkme`](https://docs.rs/linkme) distributed slice,
//! which the linker gathers into one contiguous section of the binary. Any
//! binary that links the crate defining an operation can therefore execute it.
//!
//! # Implementation details
//!
//! The name is `concat!(module_path!(), "::", <type name>)`, so it is the same
//! in every binary that links the defining crate, independent of compilation
//! order. The entry point decodes the operation and its arguments, executes
//! it, and encodes the output.
extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, DeriveInput, Error, Ident, Result};

/// Check if the `internal` attribute is present on the derive macro.
///
/// Quoted paths need to point at `crate` instead of `::spindle` if the macro
/// is being called from the `spindle` crate itself.
fn get_is_internal(attrs: &mut Vec<Attribute>) -> Result<bool> {
    let mut is_internal = None;
    let mut errors: Option<Error> = None;

    attrs.retain(|attr| {
        if !attr.path().is_ident("spindle") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("internal") {
                if is_internal.is_some() {
                    return Err(meta.error("duplicate spindle crate attribute"));
                }

                is_internal = Some(true);
                Ok(())
            } else {
                Err(meta.error("unsupported spindle attribute"))
            }
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(is_internal.unwrap_or(false)),
        Some(errors) => Err(errors),
    }
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_derive(RemoteExecute, attributes(spindle))]
pub fn remote_execute_derive(input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let is_internal = match get_is_internal(&mut input.attrs) {
        Ok(path) => path,
        Err(err) => return err.to_compile_error().into(),
    };

    // A registry entry is a single static, which cannot be generic.
    if !input.generics.params.is_empty() {
        return Error::new_spanned(
            &input.generics,
            "RemoteExecute cannot be derived for generic types",
        )
        .to_compile_error()
        .into();
    }

    let spindle_path = if is_internal {
        quote! { crate }
    } else {
        quote! { ::spindle }
    };

    // Consumers of the derive macro should not need `linkme` as a direct
    // dependency, so point the attribute at the re-export.
    let linkme_path_override = if is_internal {
        quote! {}
    } else {
        quote! {
            #[linkme(crate = #spindle_path::__private::linkme)]
        }
    };

    let name = &input.ident;
    let entry_name = Ident::new(
        &format!("__SPINDLE_OPERATION_{}", name.to_string().to_uppercase()),
        name.span(),
    );

    let expanded = quote! {
        impl #spindle_path::operation::RemoteExecute for #name {
            const NAME: &'static str = concat!(module_path!(), "::", stringify!(#name));
        }

        #[#spindle_path::__private::linkme::distributed_slice(#spindle_path::__private::OPERATIONS)]
        #linkme_path_override
        #[allow(non_upper_case_globals)]
        static #entry_name: #spindle_path::operation::OperationEntry =
            #spindle_path::operation::OperationEntry {
                name: <#name as #spindle_path::operation::RemoteExecute>::NAME,
                execute: #spindle_path::operation::execute_registered::<#name>,
            };
    };

    TokenStream::from(expanded)
}
