mod domain_event;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(DomainEvent)]
// ============================================================================

/// Derive macro for `DomainEvent`.
///
/// The event name comes from, in order of precedence:
/// - a `String` field marked `#[event(name)]`
/// - `#[event(name = "...")]` on the type
/// - the type name in lowerCamelCase (`OrderCreated` -> `orderCreated`)
///
/// The type must also implement `serde::Serialize`; its serialization becomes
/// the envelope payload.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, DomainEvent)]
/// #[event(name = "order.created")]
/// struct OrderCreated {
///     order_id: String,
/// }
///
/// #[derive(Serialize, DomainEvent)]
/// struct Renamed {
///     #[event(name)]
///     name: String,
/// }
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    domain_event::derive_domain_event(input)
}
