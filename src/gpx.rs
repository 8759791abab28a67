//! GPX track and route reader
//!
//! # Usage
//!
//! Provides an iterator that reads in sequence the trackpoints/routepoints and
//! names from a GPX file, and a [`GpxParser`] that assembles them into a
//! [`Track`](crate::Track).
//!
//! This module treats GPX routes and tracks synonymously.  All segments of all
//! tracks and routes are concatenated in document order.  Element names are
//! matched by local name, so namespace prefixes are tolerated.

use std::io::BufRead;
use std::{mem, str};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::parse::{
    ParseError, ParsedTrack, RawPoint, Result, TextBuffer, TrackBuilder, TrackParser,
    consumed_fraction, decode_document, parse_coordinate, parse_elevation, parse_time,
};
use crate::validate::FileType;

/// An item parsed from a GPX document.
#[derive(Clone, PartialEq, Debug)]
pub enum GpxItem {
    /// Indicates the start of a GPX track or route.
    TrackOrRoute,
    /// The name of a GPX track or route.
    TrackOrRouteName(String),
    /// The name given in the document's metadata.
    MetadataName(String),
    /// A point along a track segment or a route, returned in order of its
    /// position in the document.
    TrackOrRoutePoint(RawPoint),
}

/// A reader for GPX files
///
/// Implements an Iterator that emits the document's trackpoints, routepoints
/// and names.
pub struct GpxReader<R>
where
    R: BufRead,
{
    reader: Reader<R>,
    tag_path: TagPath,
    next_pt: RawPoint,
    text: TextBuffer,
    num_tag_start: usize,
    num_points: usize,
}

impl<R> GpxReader<R>
where
    R: BufRead,
{
    fn new(mut reader: Reader<R>) -> GpxReader<R> {
        // Needed because our parsing logic relies on maintaining a stack of tag
        // names, which would otherwise be broken by empty trkpt tags not
        // generating an "End" event.
        reader.config_mut().expand_empty_elements = true;

        Self {
            reader,
            tag_path: vec![],
            next_pt: RawPoint::default(),
            text: TextBuffer::default(),
            num_tag_start: 0,
            num_points: 0,
        }
    }

    pub fn from_reader(reader: R) -> GpxReader<R> {
        GpxReader::new(Reader::from_reader(reader))
    }

    /// Number of input bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.buffer_position()
    }

    fn read_point_attributes(&mut self, elt: &BytesStart) -> Result<()> {
        for attr in elt.attributes() {
            let a = attr?;
            match a.key.local_name().as_ref() {
                b"lat" => self.next_pt.lat = parse_coordinate(str::from_utf8(&a.value)?),
                b"lon" => self.next_pt.lon = parse_coordinate(str::from_utf8(&a.value)?),
                _ => (),
            }
        }
        Ok(())
    }

    fn in_text_element(&self) -> bool {
        matches!(
            self.tag_path.as_slice(),
            [Tag::Gpx, Tag::Metadata, Tag::Name]
                | [Tag::Gpx, Tag::Trk | Tag::Rte, Tag::Name]
                | [Tag::Gpx, Tag::Trk, Tag::Trkseg, Tag::Trkpt, Tag::Ele | Tag::Time]
                | [Tag::Gpx, Tag::Rte, Tag::Rtept, Tag::Ele | Tag::Time]
        )
    }

    fn next_item(&mut self) -> Result<Option<GpxItem>> {
        // Keep iterating through quick_xml events until a new GpxItem can be
        // successfully emitted, any error occurs, or EOF is reached.
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Eof => {
                    debug!(
                        "GpxReader processed {} tag start events and {} points",
                        self.num_tag_start, self.num_points
                    );
                    return Ok(None);
                }

                Event::Start(elt) => {
                    self.num_tag_start += 1;
                    self.tag_path.push(get_tag(elt.local_name().as_ref()));
                    self.text.clear();

                    match self.tag_path.as_slice() {
                        [Tag::Gpx, Tag::Trk] | [Tag::Gpx, Tag::Rte] => {
                            return Ok(Some(GpxItem::TrackOrRoute));
                        }

                        [Tag::Gpx, Tag::Trk, Tag::Trkseg, Tag::Trkpt]
                        | [Tag::Gpx, Tag::Rte, Tag::Rtept] => {
                            self.next_pt = RawPoint::default();
                            self.read_point_attributes(&elt)?;
                        }

                        _ => (),
                    }
                }

                Event::Text(text) if self.in_text_element() => self.text.push(&text)?,
                Event::CData(text) if self.in_text_element() => self.text.push(&text)?,
                Event::GeneralRef(r) if self.in_text_element() => self.text.push_ref(&r)?,

                Event::End(_) => {
                    let tag_path = mem::take(&mut self.tag_path);
                    let item = match tag_path.as_slice() {
                        [Tag::Gpx, Tag::Metadata, Tag::Name] => {
                            Some(GpxItem::MetadataName(self.text.take()))
                        }

                        [Tag::Gpx, Tag::Trk | Tag::Rte, Tag::Name] => {
                            Some(GpxItem::TrackOrRouteName(self.text.take()))
                        }

                        [Tag::Gpx, Tag::Trk, Tag::Trkseg, Tag::Trkpt, Tag::Ele]
                        | [Tag::Gpx, Tag::Rte, Tag::Rtept, Tag::Ele] => {
                            self.next_pt.ele = parse_elevation(&self.text.take());
                            None
                        }

                        [Tag::Gpx, Tag::Trk, Tag::Trkseg, Tag::Trkpt, Tag::Time]
                        | [Tag::Gpx, Tag::Rte, Tag::Rtept, Tag::Time] => {
                            self.next_pt.time = parse_time(&self.text.take());
                            None
                        }

                        [Tag::Gpx, Tag::Trk, Tag::Trkseg, Tag::Trkpt]
                        | [Tag::Gpx, Tag::Rte, Tag::Rtept] => {
                            self.num_points += 1;
                            Some(GpxItem::TrackOrRoutePoint(mem::take(&mut self.next_pt)))
                        }

                        _ => None,
                    };
                    self.tag_path = tag_path;
                    self.tag_path.pop();

                    if item.is_some() {
                        return Ok(item);
                    }
                }

                _ => (),
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Tag {
    Gpx,
    Metadata,
    Trk,
    Name,
    Trkseg,
    Trkpt,
    Rte,
    Rtept,
    Ele,
    Time,
    Unknown,
}

fn get_tag(name: &[u8]) -> Tag {
    match name {
        b"gpx" => Tag::Gpx,
        b"metadata" => Tag::Metadata,
        b"trk" => Tag::Trk,
        b"trkseg" => Tag::Trkseg,
        b"trkpt" => Tag::Trkpt,
        b"rte" => Tag::Rte,
        b"rtept" => Tag::Rtept,
        b"ele" => Tag::Ele,
        b"time" => Tag::Time,
        b"name" => Tag::Name,
        _ => Tag::Unknown,
    }
}

type TagPath = Vec<Tag>;

impl<R> Iterator for GpxReader<R>
where
    R: BufRead,
{
    type Item = Result<GpxItem>;

    fn next(&mut self) -> Option<Result<GpxItem>> {
        self.next_item().transpose()
    }
}

/// Parses GPX documents.
pub struct GpxParser;

impl GpxParser {
    fn read(bytes: &[u8], checkpoint: &Checkpoint) -> Result<ParsedTrack> {
        let document = decode_document(bytes);
        let bytes = document.as_bytes();
        let mut reader = GpxReader::from_reader(bytes);
        let mut builder = TrackBuilder::new();
        let mut ticker = checkpoint.ticker();
        let mut metadata_name = None;
        let mut num_tracks = 0usize;

        while let Some(item) = reader.next() {
            match item? {
                GpxItem::TrackOrRoute => num_tracks += 1,
                GpxItem::TrackOrRouteName(name) => builder.set_name(name),
                GpxItem::MetadataName(name) => metadata_name = metadata_name.or(Some(name)),
                GpxItem::TrackOrRoutePoint(p) => {
                    builder.add_point(p);
                    ticker.tick(|| consumed_fraction(reader.position(), bytes.len()))?;
                }
            }
        }

        debug!("Read {} GPX tracks or routes", num_tracks);
        if let Some(name) = metadata_name {
            builder.set_name(name);
        }
        checkpoint.check(Some(1.0))?;
        builder.build()
    }
}

impl TrackParser for GpxParser {
    fn file_type(&self) -> FileType {
        FileType::Gpx
    }

    fn parse_with(
        &self,
        bytes: &[u8],
        checkpoint: &Checkpoint,
    ) -> std::result::Result<ParsedTrack, ParseError> {
        Self::read(bytes, checkpoint).map_err(|kind| kind.with_format(FileType::Gpx))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{TimeZone, Utc};

    use super::{GpxItem, GpxParser, GpxReader};
    use crate::checkpoint::{CancelFlag, Checkpoint};
    use crate::measure::{Degrees, Meters};
    use crate::parse::{ParseErrorKind, RawPoint, TrackParser};

    fn raw_points(xml: &str) -> Result<Vec<RawPoint>> {
        let reader = GpxReader::from_reader(xml.as_bytes());
        let items = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                GpxItem::TrackOrRoutePoint(p) => Some(p),
                _ => None,
            })
            .collect())
    }

    fn coords(points: &[RawPoint]) -> Vec<(f64, f64)> {
        points
            .iter()
            .filter_map(|p| Some((p.lat?, p.lon?)))
            .collect()
    }

    #[test]
    fn test_trackpoints() -> Result<()> {
        let xml = r#"
<gpx>
  <trk>
    <name>Coyote</name>
    <trkseg>
      <trkpt lat="37.39987" lon="-122.13737" />
      <trkpt lat="37.39958" lon="-122.13684" />
    </trkseg>
    <trkseg>
      <trkpt lat="37.39923" lon="-122.13591" />
      <trkpt lat="37.39888" lon="-122.13498" />
    </trkseg>
  </trk>
</gpx>
"#;

        assert_eq!(
            coords(&raw_points(xml)?),
            vec![
                (37.39987, -122.13737),
                (37.39958, -122.13684),
                (37.39923, -122.13591),
                (37.39888, -122.13498),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_routepoints() -> Result<()> {
        let xml = r#"
<gpx>
  <rte>
    <name>Coyote</name>
    <rtept lat="37.39987" lon="-122.13737" />
    <rtept lat="37.39958" lon="-122.13684" />
  </rte>
</gpx>
"#;

        assert_eq!(
            coords(&raw_points(xml)?),
            vec![(37.39987, -122.13737), (37.39958, -122.13684)]
        );
        Ok(())
    }

    #[test]
    fn test_trackpoints_with_elevation_and_time() -> Result<()> {
        let xml = r#"
<gpx xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <trkseg>
      <trkpt lat="37.39987" lon="-122.13737">
        <ele>30.5</ele>
        <time>2025-04-15T16:09:37Z</time>
      </trkpt>
      <trkpt lat="37.39958" lon="-122.13684">
        <ele>n/a</ele>
        <time>not a time</time>
      </trkpt>
    </trkseg>
  </trk>
</gpx>
"#;

        let points = raw_points(xml)?;
        assert_eq!(points[0].ele, Some(30.5));
        assert_eq!(
            points[0].time,
            Some(Utc.with_ymd_and_hms(2025, 4, 15, 16, 9, 37).unwrap())
        );
        assert_eq!(points[1].ele, None);
        assert_eq!(points[1].time, None);
        Ok(())
    }

    #[test]
    fn test_invalid_trackpoints_are_skipped() -> Result<()> {
        let xml = r#"
<gpx>
  <trk>
    <trkseg>
      <trkpt lat="37.39987" lon="-122.13737"><ele>30.5</ele></trkpt>
      <trkpt lat="37.39958"><ele>29.9</ele></trkpt>
      <trkpt lat="97.0" lon="-122.13684"/>
      <trkpt lat="abc" lon="-122.13684"/>
      <trkpt lat="37.39923" lon="-122.13591"/>
    </trkseg>
  </trk>
</gpx>
"#;

        let parsed = GpxParser.parse(xml.as_bytes())?;
        assert_eq!(parsed.skipped_points, 3);
        assert_eq!(parsed.track.len(), 2);
        let last = parsed.track.last();
        assert_eq!(last.index, 1);
        assert_eq!(last.point.lat(), Degrees(37.39923));
        assert_eq!(parsed.track.first().elevation, Some(Meters(30.5)));
        Ok(())
    }

    #[test]
    fn test_no_valid_points() {
        let xml = r#"<gpx><trk><trkseg><trkpt lon="1.0"/></trkseg></trk></gpx>"#;
        let err = GpxParser.parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::NoValidPoints { skipped: 1 }));
        assert_eq!(err.to_string(), "failed to parse gpx track: no valid points");
    }

    #[test]
    fn test_track_name() -> Result<()> {
        let xml = r#"
<gpx>
  <metadata><name>Exported</name></metadata>
  <trk>
    <name>Coyote &amp; Hills</name>
    <trkseg><trkpt lat="37.39987" lon="-122.13737"/></trkseg>
  </trk>
  <trk>
    <name>Second</name>
  </trk>
</gpx>
"#;

        let parsed = GpxParser.parse(xml.as_bytes())?;
        assert_eq!(parsed.track.name(), Some("Coyote & Hills"));
        Ok(())
    }

    #[test]
    fn test_metadata_name_fallback() -> Result<()> {
        let xml = r#"
<gpx>
  <metadata><name><![CDATA[TR017-Coyote]]></name></metadata>
  <trk><trkseg><trkpt lat="37.39987" lon="-122.13737"/></trkseg></trk>
</gpx>
"#;

        let parsed = GpxParser.parse(xml.as_bytes())?;
        assert_eq!(parsed.track.name(), Some("TR017-Coyote"));
        Ok(())
    }

    #[test]
    fn test_namespace_prefix() -> Result<()> {
        let xml = r#"
<g:gpx xmlns:g="http://www.topografix.com/GPX/1/1">
  <g:trk><g:trkseg>
    <g:trkpt lat="1.0" lon="2.0"><g:ele>5</g:ele></g:trkpt>
  </g:trkseg></g:trk>
</g:gpx>
"#;

        let parsed = GpxParser.parse(xml.as_bytes())?;
        assert_eq!(parsed.track.first().elevation, Some(Meters(5.0)));
        Ok(())
    }

    const CAFE_LOOP: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<gpx version="1.1" creator="test">
  <trk>
    <name>Café loop</name>
    <trkseg>
      <trkpt lat="48.85" lon="2.35"><ele>35</ele></trkpt>
      <trkpt lat="48.86" lon="2.36"><ele>36</ele></trkpt>
    </trkseg>
  </trk>
</gpx>
"#;

    #[test]
    fn test_declared_latin1() -> Result<()> {
        let latin1: Vec<u8> = CAFE_LOOP.chars().map(|c| c as u8).collect();
        assert!(std::str::from_utf8(&latin1).is_err());

        let parsed = GpxParser.parse(&latin1)?;
        assert_eq!(parsed.track.name(), Some("Caf\u{e9} loop"));
        assert_eq!(parsed.track.len(), 2);
        assert_eq!(parsed.track.last().elevation, Some(Meters(36.0)));
        Ok(())
    }

    #[test]
    fn test_utf16() -> Result<()> {
        let doc = CAFE_LOOP.replace("ISO-8859-1", "UTF-16");
        let mut utf16 = vec![0xff, 0xfe];
        for unit in doc.encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }

        let parsed = GpxParser.parse(&utf16)?;
        assert_eq!(parsed.track.name(), Some("Caf\u{e9} loop"));
        assert_eq!(parsed.track.len(), 2);
        assert_eq!(parsed.track.first().point.lat(), Degrees(48.85));
        Ok(())
    }

    #[test]
    fn test_invalid_utf8_name_keeps_points() -> Result<()> {
        let doc = CAFE_LOOP.replace("ISO-8859-1", "UTF-8");
        let bytes: Vec<u8> = doc.chars().map(|c| c as u8).collect();

        let parsed = GpxParser.parse(&bytes)?;
        assert_eq!(parsed.track.name(), Some("Caf\u{fffd} loop"));
        assert_eq!(parsed.track.len(), 2);
        Ok(())
    }

    #[test]
    fn test_malformed_xml() {
        let xml = r#"<gpx><trk><trkseg><trkpt lat="1.0" lon="2.0"></trkseg></trk></gpx>"#;
        let err = GpxParser.parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::Xml(_)));
    }

    #[test]
    fn test_cancellation() {
        let mut xml = String::from("<gpx><trk><trkseg>");
        for i in 0..100 {
            xml.push_str(&format!(r#"<trkpt lat="1.{i}" lon="2.0"/>"#));
        }
        xml.push_str("</trkseg></trk></gpx>");

        let flag = CancelFlag::new();
        flag.cancel();
        let err = GpxParser
            .parse_with(xml.as_bytes(), &Checkpoint::new(&flag, 10))
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
