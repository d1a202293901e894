//! `#[derive(VertexLayout)]`: input-layout elements and stride of a `#[repr(C)]` vertex struct.

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, spanned::Spanned, Data, DeriveInput, Expr, Fields, Lit, Meta, Type};

/// Each named field becomes one [`LayoutElement`] read from the slot passed to `layout_elements`,
/// with consecutive input indices starting at `first_input`.
///
/// Supported field types are `f32`, `u32` and `i32` scalars, 2 to 4 element arrays of them, and
/// `[u8; 4]` (read as normalized RGBA8).
#[proc_macro_derive(VertexLayout)]
pub fn derive_vertex_layout(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    if !is_repr_c(&input.attrs) {
        return Err(syn::Error::new(
            input.ident.span(),
            "VertexLayout needs #[repr(C)] so field offsets are stable",
        ));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.ident.span(), "VertexLayout can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(
            input.ident.span(),
            "VertexLayout needs a struct with named fields",
        ));
    };

    let elements = fields
        .named
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let name = field.ident.as_ref().ok_or_else(|| syn::Error::new(field.span(), "unnamed field"))?;
            let format = field_format(&field.ty)?;
            let index = index as u32;
            Ok(quote! {
                ::meridian_rhi::LayoutElement {
                    input_index: first_input + #index,
                    buffer_slot,
                    format: ::meridian_rhi::vk::Format::#format,
                    offset: ::meridian_rhi::memoffset::offset_of!(Self, #name) as u32,
                }
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::meridian_rhi::VertexLayout for #ident #ty_generics #where_clause {
            fn stride() -> u32 {
                ::core::mem::size_of::<Self>() as u32
            }

            fn layout_elements(buffer_slot: u32, first_input: u32) -> ::std::vec::Vec<::meridian_rhi::LayoutElement> {
                ::std::vec![#(#elements),*]
            }
        }
    })
}

fn is_repr_c(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().filter(|attr| attr.path().is_ident("repr")).any(|attr| {
        attr.parse_args_with(syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated)
            .is_ok_and(|metas| metas.iter().any(|meta| meta.path().is_ident("C")))
    })
}

/// Name of the `vk::Format` constant a field is read as.
fn field_format(ty: &Type) -> syn::Result<proc_macro2::Ident> {
    let (scalar, count) = match ty {
        Type::Array(array) => {
            let count = match &array.len {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Int(int) => int.base10_parse::<usize>()?,
                    _ => return Err(syn::Error::new(array.len.span(), "array length must be an integer literal")),
                },
                _ => return Err(syn::Error::new(array.len.span(), "array length must be an integer literal")),
            };
            (scalar_name(&array.elem)?, count)
        }
        _ => (scalar_name(ty)?, 1),
    };

    let name = match (scalar.as_str(), count) {
        ("f32", 1) => "R32_SFLOAT",
        ("f32", 2) => "R32G32_SFLOAT",
        ("f32", 3) => "R32G32B32_SFLOAT",
        ("f32", 4) => "R32G32B32A32_SFLOAT",
        ("u32", 1) => "R32_UINT",
        ("u32", 2) => "R32G32_UINT",
        ("u32", 3) => "R32G32B32_UINT",
        ("u32", 4) => "R32G32B32A32_UINT",
        ("i32", 1) => "R32_SINT",
        ("i32", 2) => "R32G32_SINT",
        ("i32", 3) => "R32G32B32_SINT",
        ("i32", 4) => "R32G32B32A32_SINT",
        ("u8", 4) => "R8G8B8A8_UNORM",
        _ => {
            return Err(syn::Error::new(
                ty.span(),
                format!(
                    "`{}` has no vertex format; use f32/u32/i32, [f32|u32|i32; 2..=4] or [u8; 4]",
                    ty.to_token_stream()
                ),
            ))
        }
    };
    Ok(proc_macro2::Ident::new(name, ty.span()))
}

fn scalar_name(ty: &Type) -> syn::Result<String> {
    match ty {
        Type::Path(path) => path
            .path
            .get_ident()
            .map(|ident| ident.to_string())
            .ok_or_else(|| syn::Error::new(ty.span(), "vertex fields must be primitives or arrays of primitives")),
        _ => Err(syn::Error::new(ty.span(), "vertex fields must be primitives or arrays of primitives")),
    }
}
