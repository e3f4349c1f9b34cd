use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

/// Where the derived `name()` reads the event name from.
enum NameSource {
    Literal(String),
    Field(syn::Ident),
}

pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let source = match name_field(input)? {
        Some(field) => NameSource::Field(field),
        None => NameSource::Literal(
            literal_name(input)?.unwrap_or_else(|| to_lower_camel_case(&name.to_string())),
        ),
    };

    let body = match source {
        NameSource::Literal(value) => quote! { #value },
        NameSource::Field(field) => quote! { &self.#field },
    };

    Ok(quote! {
        impl #impl_generics ::sourced_messaging::DomainEvent for #name #ty_generics #where_clause {
            fn name(&self) -> &str {
                #body
            }
        }
    })
}

fn literal_name(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut found = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("event") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                found = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("expected `#[event(name = \"...\")]`"))
            }
        })?;
    }
    Ok(found)
}

fn name_field(input: &DeriveInput) -> syn::Result<Option<syn::Ident>> {
    let fields = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => fields,
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };

    let mut tagged = None;
    for field in &fields.named {
        for attr in &field.attrs {
            if !attr.path().is_ident("event") {
                continue;
            }
            let mut is_name = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    is_name = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `#[event(name)]`"))
                }
            })?;
            if is_name {
                if tagged.is_some() {
                    return Err(syn::Error::new_spanned(
                        field,
                        "only one field may be marked #[event(name)]",
                    ));
                }
                tagged = field.ident.clone();
            }
        }
    }
    Ok(tagged)
}

fn to_lower_camel_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
