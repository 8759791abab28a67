//! TCX (Training Center XML) track reader
//!
//! Reads trackpoints from both activities (`Activity/Lap/Track`) and courses
//! (`Course/Track`).  Trackpoints recorded without a `Position`, as happens on
//! indoor equipment, count as skipped points.

use std::io::BufRead;
use std::mem;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::parse::{
    ParseError, ParsedTrack, RawPoint, Result, TextBuffer, TrackBuilder, TrackParser,
    consumed_fraction, decode_document, parse_coordinate, parse_elevation, parse_time,
};
use crate::validate::FileType;

/// An item parsed from a TCX document.
#[derive(Clone, PartialEq, Debug)]
pub enum TcxItem {
    CourseName(String),
    ActivityNotes(String),
    Trackpoint(RawPoint),
}

pub struct TcxReader<R>
where
    R: BufRead,
{
    reader: Reader<R>,
    tag_path: Vec<Tag>,
    text: TextBuffer,
    next_pt: RawPoint,
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Tag {
    Activity,
    Course,
    Name,
    Notes,
    Track,
    Trackpoint,
    Time,
    Position,
    LatitudeDegrees,
    LongitudeDegrees,
    AltitudeMeters,
    Unknown,
}

fn get_tag(name: &[u8]) -> Tag {
    match name {
        b"Activity" => Tag::Activity,
        b"Course" => Tag::Course,
        b"Name" => Tag::Name,
        b"Notes" => Tag::Notes,
        b"Track" => Tag::Track,
        b"Trackpoint" => Tag::Trackpoint,
        b"Time" => Tag::Time,
        b"Position" => Tag::Position,
        b"LatitudeDegrees" => Tag::LatitudeDegrees,
        b"LongitudeDegrees" => Tag::LongitudeDegrees,
        b"AltitudeMeters" => Tag::AltitudeMeters,
        _ => Tag::Unknown,
    }
}

impl<R> TcxReader<R>
where
    R: BufRead,
{
    pub fn from_reader(reader: R) -> TcxReader<R> {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().expand_empty_elements = true;

        Self {
            reader,
            tag_path: vec![],
            text: TextBuffer::default(),
            next_pt: RawPoint::default(),
        }
    }

    /// Number of input bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.buffer_position()
    }

    fn in_text_element(&self) -> bool {
        matches!(
            self.tag_path.as_slice(),
            [.., Tag::Course, Tag::Name]
                | [.., Tag::Activity, Tag::Notes]
                | [.., Tag::Trackpoint, Tag::Time | Tag::AltitudeMeters]
                | [
                    ..,
                    Tag::Trackpoint,
                    Tag::Position,
                    Tag::LatitudeDegrees | Tag::LongitudeDegrees
                ]
        )
    }

    fn end_element(&mut self, tag_path: &[Tag]) -> Option<TcxItem> {
        match tag_path {
            [.., Tag::Course, Tag::Name] => Some(TcxItem::CourseName(self.text.take())),
            [.., Tag::Activity, Tag::Notes] => Some(TcxItem::ActivityNotes(self.text.take())),

            [.., Tag::Trackpoint, Tag::Time] => {
                self.next_pt.time = parse_time(&self.text.take());
                None
            }
            [.., Tag::Trackpoint, Tag::AltitudeMeters] => {
                self.next_pt.ele = parse_elevation(&self.text.take());
                None
            }
            [.., Tag::Trackpoint, Tag::Position, Tag::LatitudeDegrees] => {
                self.next_pt.lat = parse_coordinate(&self.text.take());
                None
            }
            [.., Tag::Trackpoint, Tag::Position, Tag::LongitudeDegrees] => {
                self.next_pt.lon = parse_coordinate(&self.text.take());
                None
            }

            [.., Tag::Track, Tag::Trackpoint] => {
                Some(TcxItem::Trackpoint(mem::take(&mut self.next_pt)))
            }

            _ => None,
        }
    }

    fn next_item(&mut self) -> Result<Option<TcxItem>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Eof => return Ok(None),

                Event::Start(elt) => {
                    self.tag_path.push(get_tag(elt.local_name().as_ref()));
                    self.text.clear();
                    if let [.., Tag::Track, Tag::Trackpoint] = self.tag_path.as_slice() {
                        self.next_pt = RawPoint::default();
                    }
                }

                Event::Text(text) if self.in_text_element() => self.text.push(&text)?,
                Event::CData(text) if self.in_text_element() => self.text.push(&text)?,
                Event::GeneralRef(r) if self.in_text_element() => self.text.push_ref(&r)?,

                Event::End(_) => {
                    let tag_path = mem::take(&mut self.tag_path);
                    let item = self.end_element(&tag_path);
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

impl<R> Iterator for TcxReader<R>
where
    R: BufRead,
{
    type Item = Result<TcxItem>;

    fn next(&mut self) -> Option<Result<TcxItem>> {
        self.next_item().transpose()
    }
}

/// Parses TCX documents.
pub struct TcxParser;

impl TcxParser {
    fn read(bytes: &[u8], checkpoint: &Checkpoint) -> Result<ParsedTrack> {
        let document = decode_document(bytes);
        let bytes = document.as_bytes();
        let mut reader = TcxReader::from_reader(bytes);
        let mut builder = TrackBuilder::new();
        let mut ticker = checkpoint.ticker();
        let mut notes = None;

        while let Some(item) = reader.next() {
            match item? {
                TcxItem::CourseName(name) => builder.set_name(name),
                TcxItem::ActivityNotes(text) => notes = notes.or(Some(text)),
                TcxItem::Trackpoint(p) => {
                    builder.add_point(p);
                    ticker.tick(|| consumed_fraction(reader.position(), bytes.len()))?;
                }
            }
        }

        debug!("Read {} TCX trackpoints", ticker.count());
        if let Some(notes) = notes {
            builder.set_name(notes);
        }
        checkpoint.check(Some(1.0))?;
        builder.build()
    }
}

impl TrackParser for TcxParser {
    fn file_type(&self) -> FileType {
        FileType::Tcx
    }

    fn parse_with(
        &self,
        bytes: &[u8],
        checkpoint: &Checkpoint,
    ) -> std::result::Result<ParsedTrack, ParseError> {
        Self::read(bytes, checkpoint).map_err(|kind| kind.with_format(FileType::Tcx))
    }
}
