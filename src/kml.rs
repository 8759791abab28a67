//! KML track reader
//!
//! Reads track geometry from `LineString` coordinate tuples and from
//! `gx:Track` elements, whose `when` and `gx:coord` children are paired by
//! position.  Placemarks may be nested in any number of folders.  Point
//! placemarks are not part of a track and are ignored.

use std::collections::VecDeque;
use std::io::BufRead;
use std::mem;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;
use crate::parse::{
    ParseError, ParsedTrack, RawPoint, Result, TextBuffer, TrackBuilder, TrackParser,
    consumed_fraction, decode_document, parse_coordinate, parse_elevation, parse_time,
};
use crate::validate::FileType;

/// An item parsed from a KML document.
#[derive(Clone, PartialEq, Debug)]
pub enum KmlItem {
    /// The name of a placemark.
    PlacemarkName(String),
    /// The name of the top-level document.
    DocumentName(String),
    /// A track vertex, in document order.
    Point(RawPoint),
}

pub struct KmlReader<R>
where
    R: BufRead,
{
    reader: Reader<R>,
    tag_path: Vec<Tag>,
    text: TextBuffer,
    pending: VecDeque<KmlItem>,
    track_whens: Vec<Option<DateTime<Utc>>>,
    track_coords: Vec<RawPoint>,
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Tag {
    Kml,
    Document,
    Placemark,
    Name,
    LineString,
    Coordinates,
    Track,
    When,
    Coord,
    Unknown,
}

fn get_tag(name: &[u8]) -> Tag {
    match name {
        b"kml" => Tag::Kml,
        b"Document" => Tag::Document,
        b"Placemark" => Tag::Placemark,
        b"name" => Tag::Name,
        b"LineString" => Tag::LineString,
        b"coordinates" => Tag::Coordinates,
        b"Track" => Tag::Track,
        b"when" => Tag::When,
        b"coord" => Tag::Coord,
        _ => Tag::Unknown,
    }
}

impl<R> KmlReader<R>
where
    R: BufRead,
{
    pub fn from_reader(reader: R) -> KmlReader<R> {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().expand_empty_elements = true;

        Self {
            reader,
            tag_path: vec![],
            text: TextBuffer::default(),
            pending: VecDeque::new(),
            track_whens: vec![],
            track_coords: vec![],
        }
    }

    /// Number of input bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.buffer_position()
    }

    fn in_text_element(&self) -> bool {
        matches!(
            self.tag_path.as_slice(),
            [Tag::Kml, Tag::Document, Tag::Name]
                | [.., Tag::Placemark, Tag::Name]
                | [.., Tag::LineString, Tag::Coordinates]
                | [.., Tag::Track, Tag::When | Tag::Coord]
        )
    }

    fn end_element(&mut self, tag_path: &[Tag]) {
        match tag_path {
            [Tag::Kml, Tag::Document, Tag::Name] => {
                self.pending
                    .push_back(KmlItem::DocumentName(self.text.take()));
            }

            [.., Tag::Placemark, Tag::Name] => {
                self.pending
                    .push_back(KmlItem::PlacemarkName(self.text.take()));
            }

            [.., Tag::LineString, Tag::Coordinates] => {
                let text = self.text.take();
                self.pending.extend(
                    text.split_whitespace()
                        .map(|tuple| KmlItem::Point(parse_coordinate_tuple(tuple))),
                );
            }

            [.., Tag::Track, Tag::When] => {
                self.track_whens.push(parse_time(&self.text.take()));
            }

            [.., Tag::Track, Tag::Coord] => {
                self.track_coords
                    .push(parse_track_coord(&self.text.take()));
            }

            [.., Tag::Track] => {
                let whens = mem::take(&mut self.track_whens);
                let coords = mem::take(&mut self.track_coords);
                if !whens.is_empty() && whens.len() != coords.len() {
                    warn!(
                        "gx:Track has {} when and {} coord elements",
                        whens.len(),
                        coords.len()
                    );
                }
                self.pending.extend(coords.into_iter().enumerate().map(|(i, mut p)| {
                    p.time = whens.get(i).copied().flatten();
                    KmlItem::Point(p)
                }));
            }

            _ => (),
        }
    }

    fn next_item(&mut self) -> Result<Option<KmlItem>> {
        let mut buf = Vec::new();
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }

            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Eof => return Ok(None),

                Event::Start(elt) => {
                    self.tag_path.push(get_tag(elt.local_name().as_ref()));
                    self.text.clear();
                }

                Event::Text(text) if self.in_text_element() => self.text.push(&text)?,
                Event::CData(text) if self.in_text_element() => self.text.push(&text)?,
                Event::GeneralRef(r) if self.in_text_element() => self.text.push_ref(&r)?,

                Event::End(_) => {
                    let tag_path = mem::take(&mut self.tag_path);
                    self.end_element(&tag_path);
                    self.tag_path = tag_path;
                    self.tag_path.pop();
                }

                _ => (),
            }
        }
    }
}

impl<R> Iterator for KmlReader<R>
where
    R: BufRead,
{
    type Item = Result<KmlItem>;

    fn next(&mut self) -> Option<Result<KmlItem>> {
        self.next_item().transpose()
    }
}

/// Parses a `lon,lat[,alt]` tuple from a `coordinates` element.
fn parse_coordinate_tuple(tuple: &str) -> RawPoint {
    let mut parts = tuple.split(',');
    RawPoint {
        lon: parts.next().and_then(parse_coordinate),
        lat: parts.next().and_then(parse_coordinate),
        ele: parts.next().and_then(parse_elevation),
        time: None,
    }
}

/// Parses a space-separated `lon lat [alt]` triple from a `gx:coord` element.
fn parse_track_coord(text: &str) -> RawPoint {
    let mut parts = text.split_whitespace();
    RawPoint {
        lon: parts.next().and_then(parse_coordinate),
        lat: parts.next().and_then(parse_coordinate),
        ele: parts.next().and_then(parse_elevation),
        time: None,
    }
}

/// Parses KML documents.
pub struct KmlParser;

impl KmlParser {
    fn read(bytes: &[u8], checkpoint: &Checkpoint) -> Result<ParsedTrack> {
        let document = decode_document(bytes);
        let bytes = document.as_bytes();
        let mut reader = KmlReader::from_reader(bytes);
        let mut builder = TrackBuilder::new();
        let mut ticker = checkpoint.ticker();
        let mut document_name = None;

        while let Some(item) = reader.next() {
            match item? {
                KmlItem::PlacemarkName(name) => builder.set_name(name),
                KmlItem::DocumentName(name) => document_name = document_name.or(Some(name)),
                KmlItem::Point(p) => {
                    builder.add_point(p);
                    ticker.tick(|| consumed_fraction(reader.position(), bytes.len()))?;
                }
            }
        }

        debug!("Read {} KML points", ticker.count());
        if let Some(name) = document_name {
            builder.set_name(name);
        }
        checkpoint.check(Some(1.0))?;
        builder.build()
    }
}

impl TrackParser for KmlParser {
    fn file_type(&self) -> FileType {
        FileType::Kml
    }

    fn parse_with(
        &self,
        bytes: &[u8],
        checkpoint: &Checkpoint,
    ) -> std::result::Result<ParsedTrack, ParseError> {
        Self::read(bytes, checkpoint).map_err(|kind| kind.with_format(FileType::Kml))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    use super::{KmlParser, parse_coordinate_tuple};
    use crate::measure::{Degrees, Meters};
    use crate::parse::{ParseErrorKind, TrackParser};

    #[test]
    fn test_coordinate_tuple() {
        let p = parse_coordinate_tuple("-122.1,37.4,12.5");
        assert_eq!((p.lat, p.lon, p.ele), (Some(37.4), Some(-122.1), Some(12.5)));

        let p = parse_coordinate_tuple("-122.1,37.4");
        assert_eq!((p.lat, p.lon, p.ele), (Some(37.4), Some(-122.1), None));

        let p = parse_coordinate_tuple("-122.1");
        assert_eq!(p.lat, None);
    }

    #[test]
    fn test_line_string() -> Result<()> {
        let kml = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Exported routes</name>
    <Folder>
      <Placemark>
        <name>Ridge loop</name>
        <LineString>
          <coordinates>
            -122.13737,37.39987,30.5
            -122.13684,37.39958,29.9 bogus
            -122.13591,37.39923
          </coordinates>
        </LineString>
      </Placemark>
    </Folder>
  </Document>
</kml>
"#;

        let parsed = KmlParser.parse(kml.as_bytes())?;
        assert_eq!(parsed.track.name(), Some("Ridge loop"));
        assert_eq!(parsed.track.len(), 3);
        assert_eq!(parsed.skipped_points, 1);
        let first = parsed.track.first();
        assert_relative_eq!(first.point.lat(), Degrees(37.39987));
        assert_relative_eq!(first.point.lon(), Degrees(-122.13737));
        assert_eq!(first.elevation, Some(Meters(30.5)));
        assert_eq!(parsed.track.last().elevation, None);
        Ok(())
    }

    #[test]
    fn test_utf16_without_bom() -> Result<()> {
        let kml = "<?xml version=\"1.0\" encoding=\"UTF-16BE\"?>\
            <kml><Placemark><name>Gr\u{fc}nten</name><LineString>\
            <coordinates>10.1,47.5,900 10.2,47.6,950</coordinates>\
            </LineString></Placemark></kml>";
        let bytes: Vec<u8> = kml.encode_utf16().flat_map(u16::to_be_bytes).collect();

        let parsed = KmlParser.parse(&bytes)?;
        assert_eq!(parsed.track.name(), Some("Gr\u{fc}nten"));
        assert_eq!(parsed.track.len(), 2);
        assert_eq!(parsed.track.last().elevation, Some(Meters(950.0)));
        Ok(())
    }

    #[test]
    fn test_gx_track() -> Result<()> {
        let kml = r#"
<kml xmlns="http://www.opengis.net/kml/2.2" xmlns:gx="http://www.google.com/kml/ext/2.2">
  <Document>
    <name>Morning run</name>
    <Placemark>
      <gx:Track>
        <when>2024-05-01T06:00:00Z</when>
        <when>2024-05-01T06:00:10Z</when>
        <when>2024-05-01T06:00:20Z</when>
        <gx:coord>7.0 46.0 500</gx:coord>
        <gx:coord>7.001 46.0 501</gx:coord>
        <gx:coord>7.002 46.0</gx:coord>
      </gx:Track>
    </Placemark>
  </Document>
</kml>
"#;

        let parsed = KmlParser.parse(kml.as_bytes())?;
        let track = parsed.track;
        assert_eq!(track.name(), Some("Morning run"));
        assert_eq!(track.len(), 3);
        assert_eq!(
            track.points()[1].time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 10).unwrap())
        );
        assert_eq!(track.points()[1].elevation, Some(Meters(501.0)));
        assert_eq!(track.last().elevation, None);
        Ok(())
    }

    #[test]
    fn test_points_only() {
        let kml = r#"
<kml><Document><Placemark><Point><coordinates>7.0,46.0</coordinates></Point></Placemark></Document></kml>
"#;

        let err = KmlParser.parse(kml.as_bytes()).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::NoValidPoints { skipped: 0 }));
    }
}
