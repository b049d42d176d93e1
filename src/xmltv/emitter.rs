//! XMLTV emission for `/epg/xmltv`.
//!
//! Re-assembles an XMLTV document from stored EPG data, restricted to the
//! guide ids of configured channels. UTF-8, no DTD.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use chrono::DateTime;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::db::EmissionData;

use super::types::XmltvError;

/// Convert a stored RFC 3339 UTC timestamp to XMLTV form
/// (`YYYYMMDDHHMMSS +0000`).
pub fn format_xmltv_datetime(rfc3339: &str) -> Result<String, XmltvError> {
    let dt = DateTime::parse_from_rfc3339(rfc3339).map_err(|e| {
        XmltvError::TimestampError(format!("Invalid stored timestamp '{}': {}", rfc3339, e))
    })?;
    Ok(dt.to_utc().format("%Y%m%d%H%M%S +0000").to_string())
}

/// Assemble the XMLTV document.
///
/// Emits one `<channel>` per distinct guide id among the configured channels
/// and one `<programme>` per stored program joined on those ids. Programs
/// whose stored timestamps fail to parse are skipped; one bad row should not
/// take the whole guide down.
pub fn generate_xmltv(data: &EmissionData) -> Result<String, XmltvError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(io_err)?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("source-info-name", "PlexBridge"));
    writer.write_event(Event::Start(tv)).map_err(io_err)?;

    // Guide metadata keyed by epg id, used to prefer the source's display
    // name and icon over the configured channel's.
    let guide: HashMap<&str, (&str, Option<&str>)> = data
        .epg_channels
        .iter()
        .map(|c| {
            (
                c.epg_id.as_str(),
                (c.display_name.as_str(), c.icon_url.as_deref()),
            )
        })
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    for channel in &data.channels {
        let Some(epg_id) = channel.epg_id.as_deref() else {
            continue;
        };
        if !seen.insert(epg_id) {
            continue;
        }

        let (display_name, icon) = guide
            .get(epg_id)
            .map(|(name, icon)| (*name, *icon))
            .unwrap_or((channel.name.as_str(), channel.logo_url.as_deref()));

        let mut ch = BytesStart::new("channel");
        ch.push_attribute(("id", epg_id));
        writer.write_event(Event::Start(ch)).map_err(io_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("display-name")))
            .map_err(io_err)?;
        writer
            .write_event(Event::Text(BytesText::new(display_name)))
            .map_err(io_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("display-name")))
            .map_err(io_err)?;

        if let Some(icon) = icon {
            let mut el = BytesStart::new("icon");
            el.push_attribute(("src", icon));
            writer.write_event(Event::Empty(el)).map_err(io_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("channel")))
            .map_err(io_err)?;
    }

    for program in &data.programs {
        let (start, stop) = match (
            format_xmltv_datetime(&program.start_utc),
            format_xmltv_datetime(&program.stop_utc),
        ) {
            (Ok(start), Ok(stop)) => (start, stop),
            _ => {
                tracing::warn!(
                    epg_id = %program.epg_id,
                    start = %program.start_utc,
                    "skipping program with unparseable timestamps"
                );
                continue;
            }
        };

        let mut el = BytesStart::new("programme");
        el.push_attribute(("start", start.as_str()));
        el.push_attribute(("stop", stop.as_str()));
        el.push_attribute(("channel", program.epg_id.as_str()));
        writer.write_event(Event::Start(el)).map_err(io_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("title")))
            .map_err(io_err)?;
        writer
            .write_event(Event::Text(BytesText::new(&program.title)))
            .map_err(io_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("title")))
            .map_err(io_err)?;

        if let Some(desc) = &program.description {
            writer
                .write_event(Event::Start(BytesStart::new("desc")))
                .map_err(io_err)?;
            writer
                .write_event(Event::Text(BytesText::new(desc)))
                .map_err(io_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("desc")))
                .map_err(io_err)?;
        }

        if let Some(category) = &program.category {
            writer
                .write_event(Event::Start(BytesStart::new("category")))
                .map_err(io_err)?;
            writer
                .write_event(Event::Text(BytesText::new(category)))
                .map_err(io_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("category")))
                .map_err(io_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("programme")))
            .map_err(io_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("tv")))
        .map_err(io_err)?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| XmltvError::ParseError(format!("Generated XML is not UTF-8: {}", e)))
}

fn io_err(e: std::io::Error) -> XmltvError {
    XmltvError::ParseError(format!("XML write failed: {}", e))
}
