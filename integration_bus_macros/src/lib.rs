mod integration_event;

use proc_macro::TokenStream;

/// Derive `integration_bus::IntegrationEvent` for a struct carrying an
/// `EventHeader`.
///
/// # Usage
///
/// ```ignore
/// #[derive(Serialize, Deserialize, IntegrationEvent)]
/// struct OrderStartedIntegrationEvent {
///     header: EventHeader,
///     order_id: u64,
/// }
/// ```
///
/// The header is the field named `header` unless another field is marked
/// `#[integration_event(header)]`. The type name used for the wire name is
/// the struct name unless overridden:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, IntegrationEvent)]
/// #[integration_event(name = "OrderPaymentFailedIntegrationEvent")]
/// struct PaymentFailed {
///     #[integration_event(header)]
///     meta: EventHeader,
///     order_id: u64,
/// }
/// ```
#[proc_macro_derive(IntegrationEvent, attributes(integration_event))]
pub fn derive_integration_event(input: TokenStream) -> TokenStream {
    integration_event::derive_integration_event(input)
}
