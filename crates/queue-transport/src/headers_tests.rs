//! Tests for the header codec.

use super::*;

fn sample_headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_ID.to_string(), "6f1a4b2c-0001".to_string());
    headers.insert("Custom.Ascii".to_string(), "plain value".to_string());
    headers.insert("Custom.Utf8".to_string(), "Grüße, 世界 ✓".to_string());
    headers.insert("Custom.Markup".to_string(), "<a href=\"x\">&'</a>".to_string());
    headers.insert("Custom.Empty".to_string(), String::new());
    headers.insert("Custom.Padded".to_string(), "  spaced  ".to_string());
    headers
}

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn test_round_trip_preserves_values_and_order() {
    let headers = sample_headers();
    let encoded = serialize_headers(&headers).unwrap();
    let decoded = deserialize_headers(&encoded).unwrap();

    assert_eq!(decoded, headers);
    let keys: Vec<_> = decoded.keys().cloned().collect();
    let expected: Vec<_> = headers.keys().cloned().collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_reencoding_is_stable() {
    let encoded = serialize_headers(&sample_headers()).unwrap();
    let reencoded = serialize_headers(&deserialize_headers(&encoded).unwrap()).unwrap();
    assert_eq!(reencoded, encoded);
}

#[test]
fn test_decode_tolerates_legacy_terminator() {
    let headers = sample_headers();
    let mut encoded = serialize_headers(&headers).unwrap();
    encoded.extend_from_slice(b"\0");
    assert_eq!(deserialize_headers(&encoded).unwrap(), headers);

    let mut encoded = serialize_headers(&headers).unwrap();
    encoded.extend_from_slice(b"\r\n\0garbage</Array");
    let decoded = deserialize_headers(&encoded).unwrap();
    assert_eq!(serialize_headers(&decoded).unwrap(), serialize_headers(&headers).unwrap());
}

#[test]
fn test_decode_skips_byte_order_mark() {
    let mut encoded = vec![0xEF, 0xBB, 0xBF];
    encoded.extend(serialize_headers(&sample_headers()).unwrap());
    assert_eq!(deserialize_headers(&encoded).unwrap(), sample_headers());
}

#[test]
fn test_empty_extension_yields_no_headers() {
    assert!(deserialize_headers(&[]).unwrap().is_empty());
}

#[test]
fn test_empty_header_list() {
    let encoded = serialize_headers(&Headers::new()).unwrap();
    assert!(deserialize_headers(&encoded).unwrap().is_empty());

    let self_closing = br#"<?xml version="1.0"?><ArrayOfHeaderInfo />"#;
    assert!(deserialize_headers(self_closing).unwrap().is_empty());
}

#[test]
fn test_decode_indented_document() {
    let xml = br#"<?xml version="1.0"?>
<ArrayOfHeaderInfo xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <HeaderInfo>
    <Key>Transport.MessageId</Key>
    <Value>abc</Value>
  </HeaderInfo>
  <HeaderInfo>
    <Key>Empty</Key>
    <Value />
  </HeaderInfo>
</ArrayOfHeaderInfo>"#;
    let headers = deserialize_headers(xml).unwrap();
    assert_eq!(headers.get(MESSAGE_ID).map(String::as_str), Some("abc"));
    assert_eq!(headers.get("Empty").map(String::as_str), Some(""));
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(deserialize_headers(b"definitely not xml").is_err());
    assert!(deserialize_headers(&[0xFF, 0xFE, 0x00]).is_err());
}

#[test]
fn test_decode_rejects_unexpected_elements() {
    let xml = b"<ArrayOfHeaderInfo><Header><Key>a</Key></Header></ArrayOfHeaderInfo>";
    assert!(matches!(
        deserialize_headers(xml),
        Err(HeaderError::UnexpectedElement { .. })
    ));
}

#[test]
fn test_decode_rejects_entry_without_key() {
    let xml = b"<ArrayOfHeaderInfo><HeaderInfo><Value>a</Value></HeaderInfo></ArrayOfHeaderInfo>";
    assert!(matches!(
        deserialize_headers(xml),
        Err(HeaderError::MissingKey { index: 0 })
    ));
}

#[test]
fn test_decode_rejects_truncated_payload() {
    let xml = b"<ArrayOfHeaderInfo><HeaderInfo><Key>a</Key>";
    assert!(deserialize_headers(xml).is_err());
}

// ============================================================================
// Correlation Identifiers
// ============================================================================

const GUID: &str = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";

#[test]
fn test_guid_correlation_id_gets_default_sequence() {
    assert_eq!(
        correlation_id_for_wire(GUID),
        Some(format!("{}\\0", GUID))
    );
}

#[test]
fn test_native_correlation_id_passes_through() {
    let native = format!("{}\\12345", GUID);
    assert_eq!(correlation_id_for_wire(&native), Some(native.clone()));
}

#[test]
fn test_other_correlation_ids_stay_off_the_wire() {
    assert_eq!(correlation_id_for_wire("order-42"), None);
    assert_eq!(correlation_id_for_wire(&format!("{}\\abc", GUID)), None);
    assert_eq!(correlation_id_for_wire("not-a-guid\\1"), None);
}

#[test]
fn test_correlation_id_from_wire() {
    assert_eq!(
        correlation_id_from_wire(&format!("{}\\0", GUID)),
        Some(GUID.to_string())
    );
    assert_eq!(
        correlation_id_from_wire(&format!("{}\\7", GUID)),
        Some(format!("{}\\7", GUID))
    );
    assert_eq!(
        correlation_id_from_wire("00000000-0000-0000-0000-000000000000\\0"),
        None
    );
    assert_eq!(correlation_id_from_wire(""), None);
}

// ============================================================================
// Wire Conversion
// ============================================================================

fn outgoing(headers: Headers) -> OutgoingMessage {
    OutgoingMessage::new("id-1", headers, Bytes::from_static(b"payload"))
}

#[test]
fn test_to_wire_message_maps_native_fields() {
    let mut headers = Headers::new();
    headers.insert(CORRELATION_ID.to_string(), GUID.to_string());
    headers.insert(REPLY_TO_ADDRESS.to_string(), "replies@SERVER".to_string());
    headers.insert(MESSAGE_INTENT.to_string(), "Publish".to_string());

    let wire = to_wire_message(&outgoing(headers.clone()), "LOCAL").unwrap();

    assert_eq!(wire.correlation_id, Some(format!("{}\\0", GUID)));
    assert_eq!(
        wire.response_queue,
        Some(QueueAddress::new("replies", "SERVER"))
    );
    assert_eq!(wire.app_specific, MessageIntent::Publish.code());
    assert_eq!(wire.body, Bytes::from_static(b"payload"));
    assert!(wire.recoverable);
    assert_eq!(deserialize_headers(&wire.extension).unwrap(), headers);
}

#[test]
fn test_non_guid_correlation_id_survives_as_header_only() {
    let mut headers = Headers::new();
    headers.insert(CORRELATION_ID.to_string(), "order-42".to_string());

    let wire = to_wire_message(&outgoing(headers), "LOCAL").unwrap();
    assert_eq!(wire.correlation_id, None);

    let received = extract_headers(&wire).unwrap();
    assert_eq!(
        received.get(CORRELATION_ID).map(String::as_str),
        Some("order-42")
    );
}

#[test]
fn test_guid_correlation_id_round_trips() {
    let mut headers = Headers::new();
    headers.insert(CORRELATION_ID.to_string(), GUID.to_string());
    let wire = to_wire_message(&outgoing(headers), "LOCAL").unwrap();

    // A legacy sender only populated the native field.
    let legacy = WireMessage {
        extension: Bytes::new(),
        ..wire.clone()
    };

    for message in [wire, legacy] {
        let received = extract_headers(&message).unwrap();
        assert_eq!(received.get(CORRELATION_ID).map(String::as_str), Some(GUID));
    }
}

#[test]
fn test_extract_headers_fills_missing_native_fields_only() {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_INTENT.to_string(), "Send".to_string());
    let wire = WireMessage {
        extension: Bytes::from(serialize_headers(&headers).unwrap()),
        app_specific: MessageIntent::Reply.code(),
        response_queue: Some(QueueAddress::new("replies", "HOST")),
        ..Default::default()
    };

    let received = extract_headers(&wire).unwrap();
    assert_eq!(received.get(MESSAGE_INTENT).map(String::as_str), Some("Send"));
    assert_eq!(
        received.get(REPLY_TO_ADDRESS).map(String::as_str),
        Some("replies@HOST")
    );
}

// ============================================================================
// Header Value Formats
// ============================================================================

#[test]
fn test_wire_date_format() {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 12).unwrap()
        + chrono::Duration::microseconds(123_456);
    let formatted = to_wire_format(at);
    assert_eq!(formatted, "2024-05-01 13:45:12:123456 Z");
    assert_eq!(from_wire_format(&formatted), Some(at));
    assert_eq!(from_wire_format("yesterday"), None);
}

#[test]
fn test_time_span_format() {
    assert_eq!(format_time_span(Duration::from_secs(300)), "00:05:00");
    assert_eq!(
        format_time_span(Duration::from_secs(2 * 86_400 + 3_661)),
        "2.01:01:01"
    );
    assert_eq!(format_time_span(Duration::from_millis(1_500)), "00:00:01.5000000");

    assert_eq!(parse_time_span("00:05:00"), Some(Duration::from_secs(300)));
    assert_eq!(
        parse_time_span("2.01:01:01"),
        Some(Duration::from_secs(2 * 86_400 + 3_661))
    );
    assert_eq!(parse_time_span("00:00:01.5"), Some(Duration::from_millis(1_500)));
    assert_eq!(parse_time_span("5 minutes"), None);
    assert_eq!(parse_time_span("00:61:00"), None);
}

#[test]
fn test_has_expired() {
    let now = Utc::now();
    let mut headers = Headers::new();
    assert!(!has_expired(&headers, now));

    headers.insert(TIME_TO_BE_RECEIVED.to_string(), "00:01:00".to_string());
    headers.insert(
        TIME_SENT.to_string(),
        to_wire_format(now - chrono::Duration::minutes(5)),
    );
    assert!(has_expired(&headers, now));

    headers.insert(TIME_SENT.to_string(), to_wire_format(now));
    assert!(!has_expired(&headers, now));
}

#[test]
fn test_time_span_overflow_is_rejected() {
    assert_eq!(parse_time_span("18446744073709551615.00:00:00"), None);
    assert!(parse_time_span("99999999.00:00:00").is_some());
}

#[test]
fn test_has_expired_with_unrepresentable_expiry() {
    let now = Utc::now();
    let mut headers = Headers::new();
    headers.insert(TIME_TO_BE_RECEIVED.to_string(), "99999999.00:00:00".to_string());
    headers.insert(TIME_SENT.to_string(), to_wire_format(now));

    assert!(!has_expired(&headers, now));
}
