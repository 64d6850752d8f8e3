//! Header codec.
//!
//! Headers travel in the extension field of a [`WireMessage`] as an XML list
//! of key/value pairs:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <ArrayOfHeaderInfo xmlns:xsi="..." xmlns:xsd="...">
//!   <HeaderInfo><Key>Transport.MessageId</Key><Value>42</Value></HeaderInfo>
//! </ArrayOfHeaderInfo>
//! ```
//!
//! Older senders appended a stray terminator after the closing tag, so the
//! decoder truncates the payload at the last `</ArrayOfHeaderInfo>` before
//! parsing.

use crate::address::QueueAddress;
use crate::error::HeaderError;
use crate::message::{Headers, MessageIntent, OutgoingMessage, WireMessage};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Well-known Header Keys
// ============================================================================

pub const MESSAGE_ID: &str = "Transport.MessageId";
pub const CORRELATION_ID: &str = "Transport.CorrelationId";
pub const REPLY_TO_ADDRESS: &str = "Transport.ReplyToAddress";
pub const MESSAGE_INTENT: &str = "Transport.MessageIntent";
pub const TIME_TO_BE_RECEIVED: &str = "Transport.TimeToBeReceived";
pub const TIME_SENT: &str = "Transport.TimeSent";
pub const NON_DURABLE_MESSAGE: &str = "Transport.NonDurableMessage";
pub const TIMEOUT_DESTINATION: &str = "Transport.Timeout.Destination";
pub const TIMEOUT_AT: &str = "Transport.Timeout.At";
pub const EXCEPTION_MESSAGE: &str = "Transport.ExceptionInfo.Message";
pub const FAILED_QUEUE: &str = "Transport.FailedQ";

const ROOT: &[u8] = b"ArrayOfHeaderInfo";
const ENTRY: &[u8] = b"HeaderInfo";
const KEY: &[u8] = b"Key";
const VALUE: &[u8] = b"Value";
const CLOSING_TAG: &[u8] = b"</ArrayOfHeaderInfo>";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Native correlation ids are `{guid}\{sequence}`; a GUID becomes sequence 0.
const NATIVE_SEQUENCE_SEPARATOR: char = '\\';
const DEFAULT_SEQUENCE_SUFFIX: &str = "\\0";

/// Date format used for header timestamps, e.g. `2024-05-01 13:45:12:123456 Z`.
pub const WIRE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S:%6f Z";

// ============================================================================
// Header Serialization
// ============================================================================

/// Encode headers into the extension blob.
pub fn serialize_headers(headers: &Headers) -> Result<Vec<u8>, HeaderError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut root = BytesStart::new("ArrayOfHeaderInfo");
    root.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
    root.push_attribute(("xmlns:xsd", "http://www.w3.org/2001/XMLSchema"));
    writer.write_event(Event::Start(root))?;

    for (key, value) in headers {
        writer.write_event(Event::Start(BytesStart::new("HeaderInfo")))?;
        write_text_element(&mut writer, "Key", key)?;
        write_text_element(&mut writer, "Value", value)?;
        writer.write_event(Event::End(BytesEnd::new("HeaderInfo")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("ArrayOfHeaderInfo")))?;
    Ok(writer.into_inner().into_inner())
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), HeaderError> {
    if text.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new(name)))?;
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Document,
    List,
    Entry,
    Key,
    Value,
    Done,
}

/// Decode the extension blob. An empty blob yields no headers.
pub fn deserialize_headers(extension: &[u8]) -> Result<Headers, HeaderError> {
    let payload = extension.strip_prefix(UTF8_BOM).unwrap_or(extension);
    if payload.is_empty() {
        return Ok(Headers::new());
    }

    let payload = match payload
        .windows(CLOSING_TAG.len())
        .rposition(|window| window == CLOSING_TAG)
    {
        Some(index) => &payload[..index + CLOSING_TAG.len()],
        None => payload,
    };

    let xml = std::str::from_utf8(payload)?;
    parse_header_list(xml)
}

fn parse_header_list(xml: &str) -> Result<Headers, HeaderError> {
    let mut reader = Reader::from_str(xml);
    reader.check_end_names(true);

    let mut headers = Headers::new();
    let mut state = ParseState::Document;
    let mut text = String::new();
    let mut key: Option<String> = None;
    let mut value: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                state = match (state, e.name().as_ref()) {
                    (ParseState::Document, ROOT) => ParseState::List,
                    (ParseState::List, ENTRY) => {
                        key = None;
                        value = None;
                        ParseState::Entry
                    }
                    (ParseState::Entry, KEY) => ParseState::Key,
                    (ParseState::Entry, VALUE) => ParseState::Value,
                    (_, name) => return Err(unexpected_element(name)),
                };
                text.clear();
            }
            Event::Empty(ref e) => match (state, e.name().as_ref()) {
                (ParseState::Document, ROOT) => state = ParseState::Done,
                (ParseState::Entry, KEY) => key = Some(String::new()),
                (ParseState::Entry, VALUE) => value = Some(String::new()),
                (ParseState::List, ENTRY) => {
                    return Err(HeaderError::MissingKey {
                        index: headers.len(),
                    })
                }
                (_, name) => return Err(unexpected_element(name)),
            },
            Event::Text(e) => {
                let unescaped = e.unescape()?;
                match state {
                    ParseState::Key | ParseState::Value => text.push_str(&unescaped),
                    _ if unescaped.trim().is_empty() => {}
                    _ => {
                        return Err(HeaderError::Malformed {
                            message: format!("unexpected text '{}'", unescaped.trim()),
                        })
                    }
                }
            }
            Event::CData(e) => match state {
                ParseState::Key | ParseState::Value => {
                    text.push_str(std::str::from_utf8(&e.into_inner())?);
                }
                _ => {
                    return Err(HeaderError::Malformed {
                        message: "unexpected CDATA section".to_string(),
                    })
                }
            },
            Event::End(_) => {
                state = match state {
                    ParseState::Key => {
                        key = Some(std::mem::take(&mut text));
                        ParseState::Entry
                    }
                    ParseState::Value => {
                        value = Some(std::mem::take(&mut text));
                        ParseState::Entry
                    }
                    ParseState::Entry => {
                        let entry_key = key.take().ok_or(HeaderError::MissingKey {
                            index: headers.len(),
                        })?;
                        headers.insert(entry_key, value.take().unwrap_or_default());
                        ParseState::List
                    }
                    ParseState::List => ParseState::Done,
                    ParseState::Document | ParseState::Done => {
                        return Err(HeaderError::Malformed {
                            message: "unbalanced closing tag".to_string(),
                        })
                    }
                };
            }
            Event::Eof => {
                if state == ParseState::Done {
                    return Ok(headers);
                }
                return Err(HeaderError::UnexpectedEnd);
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }
}

fn unexpected_element(name: &[u8]) -> HeaderError {
    HeaderError::UnexpectedElement {
        name: String::from_utf8_lossy(name).into_owned(),
    }
}

// ============================================================================
// Correlation Identifiers
// ============================================================================

/// Map a correlation header value onto the native correlation field.
///
/// GUIDs become `{guid}\0`, values already in `{guid}\{sequence}` form pass
/// through, anything else leaves the native field at its default (`None`).
pub fn correlation_id_for_wire(value: &str) -> Option<String> {
    if Uuid::parse_str(value).is_ok() {
        return Some(format!("{}{}", value, DEFAULT_SEQUENCE_SUFFIX));
    }
    if is_native_correlation_id(value) {
        return Some(value.to_string());
    }
    None
}

/// Recover a correlation id from the native field. The service default
/// (all-zero GUID) maps to `None`.
pub fn correlation_id_from_wire(native: &str) -> Option<String> {
    if native.is_empty() {
        return None;
    }
    let trimmed = native.strip_suffix(DEFAULT_SEQUENCE_SUFFIX).unwrap_or(native);
    let guid_part = trimmed
        .split(NATIVE_SEQUENCE_SEPARATOR)
        .next()
        .unwrap_or(trimmed);
    if Uuid::parse_str(guid_part).map(|g| g.is_nil()).unwrap_or(false) {
        return None;
    }
    Some(trimmed.to_string())
}

fn is_native_correlation_id(value: &str) -> bool {
    match value.split_once(NATIVE_SEQUENCE_SEPARATOR) {
        Some((guid, sequence)) => {
            Uuid::parse_str(guid).is_ok() && sequence.parse::<u32>().is_ok()
        }
        None => false,
    }
}

// ============================================================================
// Wire Conversion
// ============================================================================

/// Convert an outgoing message to its wire form. Delivery constraints and
/// routing flags are applied by the dispatcher.
pub fn to_wire_message(
    message: &OutgoingMessage,
    local_machine: &str,
) -> Result<WireMessage, HeaderError> {
    let extension = serialize_headers(&message.headers)?;

    let correlation_id = message
        .headers
        .get(CORRELATION_ID)
        .and_then(|value| correlation_id_for_wire(value));

    let response_queue = message
        .headers
        .get(REPLY_TO_ADDRESS)
        .and_then(|address| QueueAddress::parse(address, local_machine).ok());

    let app_specific = message
        .headers
        .get(MESSAGE_INTENT)
        .and_then(|intent| intent.parse::<MessageIntent>().ok())
        .map(MessageIntent::code)
        .unwrap_or_default();

    Ok(WireMessage {
        id: None,
        body: message.body.clone(),
        extension: Bytes::from(extension),
        correlation_id,
        label: None,
        time_to_be_received: None,
        time_to_reach_queue: None,
        recoverable: true,
        use_dead_letter_queue: false,
        use_journal_queue: false,
        app_specific,
        response_queue,
        sent_at: None,
    })
}

/// Recover the header map of a received message.
///
/// Native fields only fill headers the sender did not set explicitly.
pub fn extract_headers(message: &WireMessage) -> Result<Headers, HeaderError> {
    let mut headers = deserialize_headers(&message.extension)?;

    if !headers.contains_key(REPLY_TO_ADDRESS) {
        if let Some(response_queue) = &message.response_queue {
            headers.insert(REPLY_TO_ADDRESS.to_string(), response_queue.to_string());
        }
    }

    if !headers.contains_key(MESSAGE_INTENT) {
        if let Some(intent) = MessageIntent::from_code(message.app_specific) {
            headers.insert(MESSAGE_INTENT.to_string(), intent.to_string());
        }
    }

    if !headers.contains_key(CORRELATION_ID) {
        if let Some(correlation_id) = message
            .correlation_id
            .as_deref()
            .and_then(correlation_id_from_wire)
        {
            headers.insert(CORRELATION_ID.to_string(), correlation_id);
        }
    }

    Ok(headers)
}

// ============================================================================
// Header Value Formats
// ============================================================================

pub fn to_wire_format(at: DateTime<Utc>) -> String {
    at.format(WIRE_DATE_FORMAT).to_string()
}

pub fn from_wire_format(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), WIRE_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

const TICKS_PER_SECOND: u128 = 10_000_000;

/// Format a duration as `[d.]hh:mm:ss[.fffffff]`.
pub fn format_time_span(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    let ticks = duration.subsec_nanos() / 100;

    let mut formatted = String::new();
    if days > 0 {
        formatted.push_str(&format!("{}.", days));
    }
    formatted.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    if ticks > 0 {
        formatted.push_str(&format!(".{:07}", ticks));
    }
    formatted
}

/// Parse the `[d.]hh:mm:ss[.fffffff]` form written by [`format_time_span`].
pub fn parse_time_span(value: &str) -> Option<Duration> {
    let mut parts = value.trim().split(':');
    let (hours_part, minutes_part, seconds_part) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let (days, hours) = match hours_part.split_once('.') {
        Some((days, hours)) => (days.parse::<u64>().ok()?, hours.parse::<u64>().ok()?),
        None => (0, hours_part.parse::<u64>().ok()?),
    };
    let minutes = minutes_part.parse::<u64>().ok()?;
    let (seconds, ticks) = match seconds_part.split_once('.') {
        Some((seconds, fraction)) => {
            let digits: String = fraction.chars().chain(std::iter::repeat('0')).take(7).collect();
            (seconds.parse::<u64>().ok()?, digits.parse::<u128>().ok()?)
        }
        None => (seconds_part.parse::<u64>().ok()?, 0),
    };
    if hours > 23 || minutes > 59 || seconds > 59 {
        return None;
    }

    let whole = days
        .checked_mul(86_400)?
        .checked_add(hours * 3_600 + minutes * 60 + seconds)?;
    let nanos = (ticks % TICKS_PER_SECOND) * 100;
    Some(Duration::new(whole, nanos as u32))
}

/// Check whether a message carrying these headers has outlived its
/// `TimeToBeReceived` header.
pub fn has_expired(headers: &Headers, now: DateTime<Utc>) -> bool {
    let Some(ttbr) = headers
        .get(TIME_TO_BE_RECEIVED)
        .and_then(|value| parse_time_span(value))
    else {
        return false;
    };
    let Some(sent) = headers.get(TIME_SENT).and_then(|value| from_wire_format(value)) else {
        return false;
    };
    // A span too large to represent never expires.
    chrono::Duration::from_std(ttbr)
        .ok()
        .and_then(|ttbr| sent.checked_add_signed(ttbr))
        .is_some_and(|expiry| expiry < now)
}

#[cfg(test)]
#[path = "headers_tests.rs"]
mod tests;
