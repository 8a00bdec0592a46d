use meshbus_protocol::{Ack, Envelope, ServiceDetails};

#[test]
fn test_envelope_survives_the_wire() {
    let service = ServiceDetails::new("orders");
    let mut req = Envelope::request("orders:create", &service, vec!["batch-7".into()]);
    req.payload = Some(serde_json::json!({ "sku": "A-1", "qty": 2 }));
    req.complete_meta();

    let bytes = req.to_bytes().unwrap();
    let decoded = Envelope::from_slice(&bytes).unwrap();

    assert_eq!(decoded, req);
    assert!(decoded.meta.published_at.is_some());
}

#[test]
fn test_ack_only_envelope_has_no_payload() {
    let service = ServiceDetails::new("orders");
    let req = Envelope::request("orders:create", &service, vec![]);
    let mut ack = Envelope::response_to(&req, &service).unwrap();
    ack.ack = Some(Ack::new("responder-1").with_responses_remaining(1));

    assert!(ack.is_ack_only());
    let json = String::from_utf8(ack.to_bytes().unwrap()).unwrap();
    assert!(!json.contains("\"payload\""));
}

#[test]
fn test_missing_optional_fields_default() {
    let json = r#"{
        "id": "m1",
        "correlationId": "c1",
        "topics": { "to": "a:b" },
        "meta": {
            "createdAt": "2024-01-01T00:00:00Z",
            "serviceDetails": { "name": "svc", "version": "1.0.0", "instanceId": "i1", "pid": 1 }
        }
    }"#;
    let env = Envelope::from_slice(json.as_bytes()).unwrap();
    assert!(env.tags.is_empty());
    assert!(env.ack.is_none());
    assert!(env.payload.is_none());
    assert_eq!(env.instance_id(), "i1");
}
