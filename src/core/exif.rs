use chrono::NaiveDateTime;
use exif::{In, Reader, Tag, Value};
use std::io::Cursor;

/// Tags consulted for the capture time, most specific first.
const CAPTURE_TIME_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime];

/// Reads capture timestamps from EXIF metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Capture time of an in-memory image, or `None` when the image carries
    /// no usable timestamp.
    pub fn capture_time(&self, bytes: &[u8]) -> Option<NaiveDateTime> {
        let mut cursor = Cursor::new(bytes);
        match Reader::new().read_from_container(&mut cursor) {
            Ok(exif) => self.first_timestamp(&exif),
            Err(_) => None,
        }
    }

    fn first_timestamp(&self, exif: &exif::Exif) -> Option<NaiveDateTime> {
        CAPTURE_TIME_TAGS.iter().find_map(|&tag| {
            let field = exif.get_field(tag, In::PRIMARY)?;
            let text = field_to_string(&field.value)?;
            parse_exif_datetime(&text)
        })
    }
}

fn field_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|ascii_val| {
            String::from_utf8_lossy(ascii_val)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
}

/// Parse the EXIF `YYYY:MM:DD HH:MM:SS` form. Blank or zeroed timestamps,
/// which some cameras write, yield `None`.
pub fn parse_exif_datetime(datetime_str: &str) -> Option<NaiveDateTime> {
    let trimmed = datetime_str.trim();
    if trimmed.is_empty() || trimmed.starts_with("0000") {
        return None;
    }

    NaiveDateTime::parse_from_str(trimmed, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| log::debug!("Unparseable EXIF datetime: {}", datetime_str))
        .ok()
}
