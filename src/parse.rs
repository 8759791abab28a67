//! Format parser capability and dispatch
//!
//! Each supported format implements [`TrackParser`], turning raw file bytes
//! into a [`Track`].  The format readers emit [`RawPoint`]s in document order
//! and feed them to a [`TrackBuilder`], which drops points without usable
//! coordinates, assigns post-drop indices and counts what it skipped.
//!
//! Use [`parse_track`] to select the parser for a validated [`FileType`].

use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::str;

use chrono::{DateTime, NaiveDateTime, Utc};
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};
use quick_xml::events::Event;
use quick_xml::events::attributes::AttrError;
use quick_xml::reader::Reader;
use thiserror::Error;
use tracing::{debug, warn};

use crate::checkpoint::{Cancelled, Checkpoint};
use crate::fit::FitParser;
use crate::gpx::GpxParser;
use crate::kml::KmlParser;
use crate::measure::{Degrees, Meters};
use crate::tcx::TcxParser;
use crate::types::{GeoPoint, Track, Trackpoint};
use crate::validate::FileType;

/// An error parsing a track file of a particular format.
#[derive(Error, Debug)]
#[error("failed to parse {format} track: {kind}")]
pub struct ParseError {
    pub format: FileType,
    #[source]
    pub kind: ParseErrorKind,
}

#[derive(Error, Debug)]
pub enum ParseErrorKind {
    #[error("XML processing error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("XML attribute processing error: {0}")]
    XmlAttr(#[from] AttrError),
    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] str::Utf8Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt file: {0}")]
    Corrupt(String),
    #[error("unsupported variant: {0}")]
    Unsupported(String),
    #[error("no valid points")]
    NoValidPoints { skipped: usize },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ParseErrorKind {
    pub(crate) fn with_format(self, format: FileType) -> ParseError {
        ParseError { format, kind: self }
    }
}

impl ParseError {
    /// Whether parsing stopped because of a cancellation request rather than
    /// a problem with the file.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ParseErrorKind::Cancelled(_))
    }

    /// Whether the file uses a variant of its format this crate does not
    /// read, as opposed to being corrupt.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.kind, ParseErrorKind::Unsupported(_))
    }
}

pub(crate) type Result<T> = std::result::Result<T, ParseErrorKind>;

/// A trackpoint as read from a file, before coordinate validation.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct RawPoint {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub ele: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

/// The result of a successful parse.
#[derive(Clone, PartialEq, Debug)]
pub struct ParsedTrack {
    pub track: Track,
    /// Number of source points dropped for missing or out-of-range
    /// coordinates.
    pub skipped_points: usize,
}

/// Accumulates trackpoints in source order.
#[derive(Default)]
pub struct TrackBuilder {
    name: Option<String>,
    points: Vec<Trackpoint>,
    num_points_skipped: usize,
}

impl TrackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the track name, unless one was already found.
    pub fn set_name(&mut self, name: String) {
        let name = name.trim();
        if self.name.is_none() && !name.is_empty() {
            self.name = Some(name.to_owned());
        }
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    /// Adds a point, or counts it as skipped if its coordinates are absent or
    /// out of range.
    pub fn add_point(&mut self, raw: RawPoint) {
        let point = match (raw.lat, raw.lon) {
            (Some(lat), Some(lon)) => GeoPoint::new(Degrees(lat), Degrees(lon)),
            _ => {
                self.num_points_skipped += 1;
                return;
            }
        };

        match point {
            Ok(point) => {
                let index = self.points.len();
                self.points.push(Trackpoint::new(
                    index,
                    point,
                    raw.ele.map(Meters),
                    raw.time,
                ));
            }
            Err(err) => {
                debug!("Skipping trackpoint: {}", err);
                self.num_points_skipped += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn build(self) -> Result<ParsedTrack> {
        if self.num_points_skipped > 0 {
            warn!(
                "Skipped {} trackpoints without valid coordinates",
                self.num_points_skipped
            );
        }
        let track = Track::new(self.name, self.points).map_err(|_| {
            ParseErrorKind::NoValidPoints {
                skipped: self.num_points_skipped,
            }
        })?;
        debug!(
            "Built track of {} points ({} skipped)",
            track.len(),
            self.num_points_skipped
        );
        Ok(ParsedTrack {
            track,
            skipped_points: self.num_points_skipped,
        })
    }
}

/// The capability of decoding one track file format.
pub trait TrackParser {
    /// The format this parser reads.
    fn file_type(&self) -> FileType;

    /// Parses `bytes`, observing `checkpoint` for cancellation and reporting
    /// the fraction of input consumed.
    fn parse_with(
        &self,
        bytes: &[u8],
        checkpoint: &Checkpoint,
    ) -> std::result::Result<ParsedTrack, ParseError>;

    fn parse(&self, bytes: &[u8]) -> std::result::Result<ParsedTrack, ParseError> {
        self.parse_with(bytes, &Checkpoint::unbounded())
    }
}

/// Returns the parser for a file type.
pub fn parser_for(file_type: FileType) -> &'static dyn TrackParser {
    match file_type {
        FileType::Gpx => &GpxParser,
        FileType::Kml => &KmlParser,
        FileType::Tcx => &TcxParser,
        FileType::Fit => &FitParser,
    }
}

/// Parses `bytes` as a track of the given file type.
#[tracing::instrument(level = "debug", skip(bytes, checkpoint), fields(len = bytes.len()))]
pub fn parse_track(
    file_type: FileType,
    bytes: &[u8],
    checkpoint: &Checkpoint,
) -> std::result::Result<ParsedTrack, ParseError> {
    parser_for(file_type).parse_with(bytes, checkpoint)
}

/// Fraction of an input consumed, given a byte position.
pub(crate) fn consumed_fraction(position: u64, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        position as f64 / total as f64
    }
}

/// Leading bytes searched for an XML declaration.
const XML_DECL_SCAN_LEN: usize = 1024;

/// Transcodes an XML document to UTF-8.
///
/// The source encoding is taken from a byte order mark, else from the
/// `encoding` of the XML declaration, else UTF-8.  BOM-less UTF-16 is
/// recognized by its leading `<`.  Malformed sequences become U+FFFD, so the
/// result is always valid UTF-8.
///
/// The declaration is left in place, so readers of the result must decode it
/// as UTF-8 regardless of what it declares.
pub(crate) fn decode_document(bytes: &[u8]) -> Cow<'_, str> {
    let encoding = match bytes {
        [b'<', 0, ..] => UTF_16LE,
        [0, b'<', ..] => UTF_16BE,
        _ => declared_encoding(bytes).unwrap_or(UTF_8),
    };

    // A byte order mark overrides the guess.
    let (text, actual, malformed) = encoding.decode(bytes);
    if malformed {
        warn!(
            "Replaced malformed {} sequences in the document",
            actual.name()
        );
    }
    if actual != UTF_8 {
        debug!("Transcoded {} document to UTF-8", actual.name());
    }
    text
}

fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let mut reader = Reader::from_reader(&bytes[..bytes.len().min(XML_DECL_SCAN_LEN)]);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Decl(decl)) => return decl.encoder(),
            Ok(Event::Text(_)) => (),
            _ => return None,
        }
    }
}

/// Parses an XML timestamp, returning `None` if it cannot be read.
///
/// Accepts RFC 3339, and ISO 8601 date-times without a zone designator, which
/// are taken to be UTC.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses an elevation, returning `None` if it is absent or not a finite
/// number.
pub fn parse_elevation(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses a coordinate, returning `None` if it is not a finite number.  Range
/// checks happen in [`TrackBuilder::add_point`].
pub fn parse_coordinate(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Character data collected across one element's text events.
#[derive(Default)]
pub(crate) struct TextBuffer(String);

impl TextBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.push_str(str::from_utf8(bytes)?);
        Ok(())
    }

    /// Appends the text an entity or character reference stands for, given
    /// its name without the surrounding `&` and `;`.
    pub fn push_ref(&mut self, name: &[u8]) -> Result<()> {
        let name = str::from_utf8(name)?;
        if let Some(s) = quick_xml::escape::resolve_predefined_entity(name) {
            self.0.push_str(s);
        } else if let Some(c) = resolve_char_ref(name) {
            self.0.push(c);
        } else {
            debug!("Ignoring unknown entity reference &{};", name);
        }
        Ok(())
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.0)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Display for TextBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn resolve_char_ref(name: &str) -> Option<char> {
    let code = name.strip_prefix('#')?;
    let value = match code.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => code.parse::<u32>().ok()?,
    };
    char::from_u32(value)
}
