//! XMLTV streaming parser using quick-xml.
//!
//! Memory-efficient streaming parse of `<channel>` and `<programme>` elements;
//! the document is never materialized as a DOM.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::types::{ParsedChannel, ParsedProgram, XmltvError};

/// Parse XMLTV data from bytes.
///
/// Returns `(channels, programs)`. Channels are deduplicated by id (first
/// occurrence wins) and sorted for deterministic ordering. Programmes missing
/// required attributes fail the whole parse; a malformed guide should mark the
/// source failed rather than half-ingest.
pub fn parse_xmltv_data(data: &[u8]) -> Result<(Vec<ParsedChannel>, Vec<ParsedProgram>), XmltvError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut channels_map: HashMap<String, ParsedChannel> = HashMap::new();
    let mut programs = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"channel" => {
                    let channel = parse_channel(&mut reader, &e)?;
                    channels_map.entry(channel.epg_id.clone()).or_insert(channel);
                }
                b"programme" => {
                    let program = parse_program(&mut reader, &e)?;
                    programs.push(program);
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(XmltvError::ParseError(format!(
                    "XML parse error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    let mut channels: Vec<ParsedChannel> = channels_map.into_values().collect();
    channels.sort_by(|a, b| a.epg_id.cmp(&b.epg_id));

    Ok((channels, programs))
}

/// Parse a `<channel>` element.
fn parse_channel(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<ParsedChannel, XmltvError> {
    let epg_id = get_attribute(start, b"id")
        .ok_or_else(|| XmltvError::ParseError("Channel missing id attribute".into()))?;

    let mut display_name: Option<String> = None;
    let mut icon: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"display-name" => {
                    if display_name.is_none() {
                        display_name = Some(read_element_text(reader)?);
                    }
                }
                b"icon" => {
                    icon = get_attribute(&e, b"src");
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"channel" => break,
            Ok(Event::Eof) => {
                return Err(XmltvError::ParseError(
                    "Unexpected EOF while parsing channel".into(),
                ))
            }
            Err(e) => return Err(XmltvError::ParseError(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let display_name =
        display_name.ok_or_else(|| XmltvError::ParseError("Channel missing display-name".into()))?;

    Ok(ParsedChannel {
        epg_id,
        display_name,
        icon,
    })
}

/// Parse a `<programme>` element.
fn parse_program(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<ParsedProgram, XmltvError> {
    let epg_id = get_attribute(start, b"channel")
        .ok_or_else(|| XmltvError::ParseError("Programme missing channel attribute".into()))?;

    let start_str = get_attribute(start, b"start")
        .ok_or_else(|| XmltvError::ParseError("Programme missing start attribute".into()))?;

    let stop_str = get_attribute(start, b"stop")
        .ok_or_else(|| XmltvError::ParseError("Programme missing stop attribute".into()))?;

    let start_utc = parse_xmltv_timestamp(&start_str)?;
    let stop_utc = parse_xmltv_timestamp(&stop_str)?;

    let mut title: Option<String> = None;
    let mut description: Option<String> = None;
    let mut category: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"title" => {
                    if title.is_none() {
                        title = Some(read_element_text(reader)?);
                    }
                }
                b"desc" => {
                    if description.is_none() {
                        description = Some(read_element_text(reader)?);
                    }
                }
                b"category" => {
                    if category.is_none() {
                        category = Some(read_element_text(reader)?);
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"programme" => break,
            Ok(Event::Eof) => {
                return Err(XmltvError::ParseError(
                    "Unexpected EOF while parsing programme".into(),
                ))
            }
            Err(e) => return Err(XmltvError::ParseError(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let title = title.ok_or_else(|| XmltvError::ParseError("Programme missing title".into()))?;

    Ok(ParsedProgram {
        epg_id,
        title,
        description,
        start_utc,
        stop_utc,
        category,
    })
}

/// Parse XMLTV timestamp format to RFC 3339 UTC.
///
/// XMLTV format: `YYYYMMDDhhmmss ±HHMM` (e.g. `20240101120000 +0000`); the
/// offset is optional and defaults to UTC.
pub fn parse_xmltv_timestamp(s: &str) -> Result<String, XmltvError> {
    let s = s.trim();
    let parts: Vec<&str> = s.split_whitespace().collect();

    if parts.is_empty() {
        return Err(XmltvError::TimestampError(format!("Empty timestamp: '{}'", s)));
    }

    let datetime_str = parts[0];
    let naive = NaiveDateTime::parse_from_str(datetime_str, "%Y%m%d%H%M%S").map_err(|e| {
        XmltvError::TimestampError(format!("Invalid datetime '{}': {}", datetime_str, e))
    })?;

    let datetime_utc = if parts.len() > 1 {
        let offset = parse_timezone_offset(parts[1])?;
        let datetime_local = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| XmltvError::TimestampError("Ambiguous or invalid local time".into()))?;
        datetime_local.with_timezone(&Utc)
    } else {
        DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
    };

    Ok(datetime_utc.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Parse timezone offset string (±HHMM) to FixedOffset.
fn parse_timezone_offset(s: &str) -> Result<FixedOffset, XmltvError> {
    if s.len() < 5 {
        return Err(XmltvError::TimestampError(format!(
            "Invalid timezone offset: '{}'",
            s
        )));
    }

    let sign = match &s[0..1] {
        "+" => 1,
        "-" => -1,
        _ => {
            return Err(XmltvError::TimestampError(format!(
                "Invalid timezone sign: '{}'",
                s
            )))
        }
    };

    let hours: i32 = s[1..3]
        .parse()
        .map_err(|_| XmltvError::TimestampError(format!("Invalid timezone hours: '{}'", &s[1..3])))?;

    let minutes: i32 = s[3..5].parse().map_err(|_| {
        XmltvError::TimestampError(format!("Invalid timezone minutes: '{}'", &s[3..5]))
    })?;

    let total_secs = sign * (hours * 3600 + minutes * 60);

    FixedOffset::east_opt(total_secs).ok_or_else(|| {
        XmltvError::TimestampError(format!("Invalid timezone offset seconds: {}", total_secs))
    })
}

/// Get an attribute value from an element.
fn get_attribute(element: &BytesStart, attr_name: &[u8]) -> Option<String> {
    element
        .attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == attr_name)
        .and_then(|a| String::from_utf8(a.value.into_owned()).ok())
}

/// Read the text content of the current element.
fn read_element_text(reader: &mut Reader<&[u8]>) -> Result<String, XmltvError> {
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => {
                text.push_str(
                    &e.unescape()
                        .map_err(|e| XmltvError::ParseError(e.to_string()))?,
                );
            }
            Ok(Event::End(_)) => break,
            Ok(Event::Eof) => {
                return Err(XmltvError::ParseError(
                    "Unexpected EOF while reading element text".into(),
                ))
            }
            Err(e) => return Err(XmltvError::ParseError(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}
