//! Event naming and envelope wire format.

use sourced_messaging::{BrokerError, DomainEvent, Envelope};

use crate::support::{InvoiceIssued, OrderCancelled, OrderCreated};

#[test]
fn name_from_tagged_field() {
    let event = OrderCreated::new("123");
    assert_eq!(event.name(), "orderCreated");
}

#[test]
fn name_from_attribute() {
    let event = OrderCancelled {
        order_id: "123".into(),
    };
    assert_eq!(event.name(), "order.cancelled");
}

#[test]
fn name_defaults_to_type_name() {
    let event = InvoiceIssued {
        invoice_id: "inv-1".into(),
    };
    assert_eq!(event.name(), "invoiceIssued");
}

#[test]
fn envelope_carries_name_and_payload() {
    let envelope = Envelope::from_event(&OrderCreated::new("123")).unwrap();
    let wire: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

    let fields: Vec<&String> = wire.as_object().unwrap().keys().collect();
    assert_eq!(fields, vec!["name", "payload"]);
    assert_eq!(wire["name"], "orderCreated");

    let parsed = Envelope::parse(&envelope.encode().unwrap()).unwrap();
    assert_eq!(parsed.decode::<OrderCreated>().unwrap(), OrderCreated::new("123"));
}

#[test]
fn empty_event_name_is_rejected() {
    let mut event = OrderCreated::new("123");
    event.event_name.clear();
    assert!(matches!(
        Envelope::from_event(&event),
        Err(BrokerError::EmptyEventName)
    ));
}
