//! XMLTV format support: fetching, streaming parse, and re-emission.

pub mod emitter;
pub mod fetcher;
pub mod parser;
pub mod types;

pub use emitter::{format_xmltv_datetime, generate_xmltv};
pub use fetcher::{detect_gzip, fetch_xmltv};
pub use parser::{parse_xmltv_data, parse_xmltv_timestamp};
pub use types::{ParsedChannel, ParsedProgram, XmltvError};
