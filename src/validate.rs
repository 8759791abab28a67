//! Cheap structural checks on uploaded track files
//!
//! [`validate`] decides whether a file is worth handing to a parser: its
//! declared extension must name a supported format, it must fit under the
//! configured size limit, and a short prefix of its content must look like
//! the declared format.  Passing validation does not guarantee that a full
//! parse succeeds.

use std::path::Path;

use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};

use crate::parse::decode_document;

/// Default upper bound on accepted file sizes, 50 MiB.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Minimum length of a FIT file header.
pub const FIT_MIN_HEADER_SIZE: usize = 12;

/// Number of leading bytes decoded for the XML sniff.
const XML_SNIFF_LEN: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported file format: {0:?}")]
    UnsupportedFormat(String),
    #[error("file size {size} bytes exceeds the maximum of {max} bytes")]
    SizeExceeded { size: u64, max: u64 },
    #[error("malformed content: {0}")]
    MalformedContent(String),
}

type Result<T> = std::result::Result<T, ValidationError>;

/// A supported track file format.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString, Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Gpx,
    Kml,
    Fit,
    Tcx,
}

impl FileType {
    /// Resolves a declared extension such as `"gpx"`, `".GPX"` or `"Fit"`.
    pub fn from_extension(extension: &str) -> Result<FileType> {
        let ext = extension.trim().trim_start_matches('.');
        ext.parse::<FileType>()
            .map_err(|_| ValidationError::UnsupportedFormat(extension.to_owned()))
    }

    /// Resolves the file type from a file name's extension.
    pub fn from_filename(name: &str) -> Result<FileType> {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => Self::from_extension(ext),
            None => Err(ValidationError::UnsupportedFormat(name.to_owned())),
        }
    }

    /// Whether the format is XML text, as opposed to binary FIT.
    pub fn is_xml(&self) -> bool {
        !matches!(self, FileType::Fit)
    }

    /// The root element marker the XML sniff looks for.
    fn root_marker(&self) -> Option<&'static str> {
        match self {
            FileType::Gpx => Some("<gpx"),
            FileType::Kml => Some("<kml"),
            FileType::Tcx => Some("<TrainingCenterDatabase"),
            FileType::Fit => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValidationOptions {
    max_size_bytes: u64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

impl ValidationOptions {
    pub fn with_max_size_bytes(self, max_size_bytes: u64) -> Self {
        Self { max_size_bytes }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }
}

/// The outcome of validating a file, in the shape reported to callers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub file_type: Option<FileType>,
    pub file_size: Option<u64>,
    pub error: Option<ValidationError>,
}

/// A file that passed validation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValidatedFile {
    pub file_type: FileType,
    pub file_size: u64,
}

impl ValidationResult {
    fn passed(file: ValidatedFile) -> Self {
        Self {
            valid: true,
            file_type: Some(file.file_type),
            file_size: Some(file.file_size),
            error: None,
        }
    }

    fn failed(file_type: Option<FileType>, file_size: u64, error: ValidationError) -> Self {
        Self {
            valid: false,
            file_type,
            file_size: Some(file_size),
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<ValidatedFile> {
        match (self.error, self.file_type, self.file_size) {
            (Some(err), _, _) => Err(err),
            (None, Some(file_type), Some(file_size)) => Ok(ValidatedFile {
                file_type,
                file_size,
            }),
            (None, file_type, _) => Err(ValidationError::UnsupportedFormat(
                file_type.map(|t| t.to_string()).unwrap_or_default(),
            )),
        }
    }
}

/// Validates a file's declared extension, size and leading content.
///
/// Pure: reads only a bounded prefix of `bytes` and never parses the whole
/// document.
pub fn validate(
    bytes: &[u8],
    declared_extension: &str,
    options: &ValidationOptions,
) -> ValidationResult {
    let file_size = bytes.len() as u64;
    let file_type = match FileType::from_extension(declared_extension) {
        Ok(t) => t,
        Err(err) => return ValidationResult::failed(None, file_size, err),
    };

    if file_size > options.max_size_bytes {
        return ValidationResult::failed(
            Some(file_type),
            file_size,
            ValidationError::SizeExceeded {
                size: file_size,
                max: options.max_size_bytes,
            },
        );
    }

    let sniffed = if file_type.is_xml() {
        sniff_xml(bytes, file_type)
    } else {
        sniff_fit(bytes)
    };

    match sniffed {
        Ok(()) => {
            debug!("Validated {} file of {} bytes", file_type, file_size);
            ValidationResult::passed(ValidatedFile {
                file_type,
                file_size,
            })
        }
        Err(err) => ValidationResult::failed(Some(file_type), file_size, err),
    }
}

fn sniff_xml(bytes: &[u8], file_type: FileType) -> Result<()> {
    let prefix = &bytes[..bytes.len().min(XML_SNIFF_LEN)];
    let text = decode_document(prefix);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let body = strip_xml_declaration(text);

    if let Some(marker) = file_type.root_marker() {
        if body.contains(marker) {
            return Ok(());
        }
    }

    if body.contains('<') {
        warn!(
            "No {} root element found in the leading {} bytes; accepting as generic XML",
            file_type,
            prefix.len()
        );
        return Ok(());
    }

    Err(ValidationError::MalformedContent(format!(
        "content does not look like {} XML",
        file_type
    )))
}

fn strip_xml_declaration(text: &str) -> &str {
    if text.starts_with("<?xml") {
        match text.find("?>") {
            Some(end) => text[end + 2..].trim_start(),
            None => "",
        }
    } else {
        text
    }
}

fn sniff_fit(bytes: &[u8]) -> Result<()> {
    if bytes.len() < FIT_MIN_HEADER_SIZE {
        return Err(ValidationError::MalformedContent(format!(
            "FIT header requires at least {} bytes, found {}",
            FIT_MIN_HEADER_SIZE,
            bytes.len()
        )));
    }
    if &bytes[8..12] != b".FIT" {
        return Err(ValidationError::MalformedContent(
            "missing .FIT signature in file header".to_owned(),
        ));
    }
    Ok(())
}
