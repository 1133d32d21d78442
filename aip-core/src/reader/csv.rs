//! Delimited text files with a header row.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use super::{RecordSource, StreamReader};
use crate::settings::deserialize_flag;
use crate::{AipError, Record, Result, Settings};

/// Reader for CSV files, see [`CsvSource`]
pub type CsvReader = StreamReader<CsvSource>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "UTF-8" | "UTF8" => Ok(Encoding::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => Ok(Encoding::Latin1),
            other => Err(AipError::configuration(format!(
                "Unsupported csv_string_encoding '{other}'"
            ))),
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CsvOptions {
    csv_separator: String,
    csv_string_enclosure: String,
    csv_string_escape: Option<String>,
    csv_string_encoding: String,
    #[serde(deserialize_with = "deserialize_flag")]
    skip_empty_lines: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            csv_separator: ";".to_string(),
            csv_string_enclosure: "\"".to_string(),
            csv_string_escape: None,
            csv_string_encoding: "UTF-8".to_string(),
            skip_empty_lines: false,
        }
    }
}

fn single_byte(option: &str, value: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(AipError::configuration(format!(
            "{option} must be a single ASCII character, got '{value}'"
        ))),
    }
}

/// Rows of a delimited file as records keyed by the header row
///
/// Rows longer than the header get `Column N` names for the extra values,
/// shorter rows are padded with empty strings. Lines without any field are
/// always skipped; with `skip_empty_lines` rows whose fields are all blank
/// are skipped too.
pub struct CsvSource {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    encoding: Encoding,
    skip_empty_lines: bool,
    rows: Option<csv::Reader<BufReader<File>>>,
    headers: Vec<String>,
    row: csv::ByteRecord,
}

impl CsvSource {
    fn builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .escape(self.escape)
            .double_quote(self.escape.is_none());
        builder
    }

    fn next_row(&mut self) -> Option<Result<Vec<String>>> {
        let rows = self.rows.as_mut()?;
        loop {
            match rows.read_byte_record(&mut self.row) {
                Ok(false) => return None,
                Ok(true) => {}
                Err(e) => return Some(Err(AipError::record(format!("Couldn't read record: {e}")))),
            }
            if self.skip_empty_lines && self.row.iter().all(|f| f.iter().all(u8::is_ascii_whitespace)) {
                continue;
            }
            return Some(Ok(self.row.iter().map(|f| self.encoding.decode(f)).collect()));
        }
    }
}

fn align(headers: &mut Vec<String>, mut values: Vec<String>) -> Record {
    while headers.len() < values.len() {
        headers.push(format!("Column {}", headers.len() + 1));
    }
    values.resize(headers.len(), String::new());
    Record::from_fields(headers.iter().cloned().zip(values))
}

impl RecordSource for CsvSource {
    const CLASS: &'static str = "csv";

    fn from_settings(configuration: &Settings) -> Result<Self> {
        let options: CsvOptions = configuration.parse()?;
        let escape = match options.csv_string_escape.as_deref() {
            None | Some("") => None,
            Some(escape) => Some(single_byte("csv_string_escape", escape)?),
        };
        Ok(Self {
            delimiter: single_byte("csv_separator", &options.csv_separator)?,
            quote: single_byte("csv_string_enclosure", &options.csv_string_enclosure)?,
            escape,
            encoding: Encoding::from_name(&options.csv_string_encoding)?,
            skip_empty_lines: options.skip_empty_lines,
            rows: None,
            headers: Vec::new(),
            row: csv::ByteRecord::new(),
        })
    }

    fn can_read(&self, uri: &str) -> bool {
        Path::new(uri).is_file() && File::open(uri).is_ok()
    }

    fn open(&mut self, uri: &str) -> Result<()> {
        let file = File::open(uri)
            .map_err(|e| AipError::source_access(format!("Couldn't open source '{uri}': {e}")))?;
        self.rows = Some(self.builder().from_reader(BufReader::new(file)));
        self.headers = match self.next_row() {
            Some(header) => header?,
            None => Vec::new(),
        };
        if let Some(first) = self.headers.first_mut() {
            if let Some(stripped) = first.strip_prefix('\u{feff}') {
                *first = stripped.to_string();
            }
        }
        Ok(())
    }

    fn read_record(&mut self) -> Option<Result<Record>> {
        let values = match self.next_row()? {
            Ok(values) => values,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(align(&mut self.headers, values)))
    }

    fn close(&mut self) {
        self.rows = None;
        self.headers.clear();
    }
}
