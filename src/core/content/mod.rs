// Content normalization: raw Drive exports -> canonical JSON.
//
// Exactly two source shapes are supported. Documents are plain-text exports
// run through the ArchieML parser; spreadsheets are per-sheet value grids
// zipped into row objects. Anything else is a terminal error for that file,
// never for the batch.

pub mod archieml;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::schedule::{run_spaced, SpacedOp};
use crate::core::source::{DocumentSource, SourceError};
use crate::core::sync::{FileKind, TrackedFile};

/// Sheets named exactly this stay as a raw 2-D grid instead of row objects.
pub const TABLE_DATA_SHEET: &str = "tableDataSheet";

/// Documents whose title starts with this marker opt out of the
/// http -> https rewrite.
pub const PLAIN_HTTP_MARKER: &str = "[HTTP]";

/// Fixed spacing between per-sheet value fetches. Keeps a many-sheet
/// spreadsheet under the Sheets API burst limit.
const SHEET_FETCH_SPACING: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("mimeType {0:?} not recognized")]
    UnsupportedMime(String),

    #[error("missing export links")]
    MissingExportLinks,

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// The normalized JSON body for one file, plus the table flag a spreadsheet
/// batch derives from its sheet names.
#[derive(Debug, Clone)]
pub struct NormalizedContent {
    pub body: Value,
    pub is_table: Option<bool>,
}

/// Rewrites insecure link schemes unless the document title carries the
/// literal `[HTTP]` opt-out marker.
pub fn clean_raw(title: &str, raw: &str) -> String {
    if title.starts_with(PLAIN_HTTP_MARKER) {
        raw.to_string()
    } else {
        raw.replace("http://", "https://")
    }
}

/// Converts one file's current content into its canonical JSON form,
/// dispatching on MIME type.
pub async fn normalize(
    source: Arc<dyn DocumentSource>,
    file: &TrackedFile,
) -> Result<NormalizedContent, ContentError> {
    match FileKind::from_mime(&file.metadata.mime_type) {
        Some(FileKind::Document) => normalize_document(source, file).await,
        Some(FileKind::Spreadsheet) => normalize_spreadsheet(source, file).await,
        None => Err(ContentError::UnsupportedMime(
            file.metadata.mime_type.clone(),
        )),
    }
}

async fn normalize_document(
    source: Arc<dyn DocumentSource>,
    file: &TrackedFile,
) -> Result<NormalizedContent, ContentError> {
    let raw = source.export_plain_text(&file.metadata.id).await?;
    let cleaned = clean_raw(&file.metadata.title, &raw);
    Ok(NormalizedContent {
        body: archieml::load(&cleaned),
        is_table: None,
    })
}

async fn normalize_spreadsheet(
    source: Arc<dyn DocumentSource>,
    file: &TrackedFile,
) -> Result<NormalizedContent, ContentError> {
    // Distinct from an unrecognized MIME type: the file claims to be a
    // spreadsheet but Drive gave us no way to export it.
    if file
        .metadata
        .export_links
        .as_ref()
        .map_or(true, |links| links.is_empty())
    {
        return Err(ContentError::MissingExportLinks);
    }

    let titles = source.list_sheet_titles(&file.metadata.id).await?;

    // All-or-nothing: one failed sheet fails the whole spreadsheet, and
    // sheets whose delay has not fired yet are never fetched.
    let ops: Vec<SpacedOp<(String, Value), ContentError>> = titles
        .into_iter()
        .map(|sheet_title| {
            let source = source.clone();
            let spreadsheet_id = file.metadata.id.clone();
            let file_title = file.metadata.title.clone();
            Box::pin(async move {
                let grid = source
                    .fetch_sheet_values(&spreadsheet_id, &sheet_title)
                    .await?;
                let json = sheet_to_json(&file_title, &sheet_title, grid);
                Ok((sheet_title, json))
            }) as SpacedOp<(String, Value), ContentError>
        })
        .collect();

    let sheet_jsons = run_spaced(ops, SHEET_FETCH_SPACING).await?;

    let is_table = sheet_jsons
        .iter()
        .any(|(title, _)| title == TABLE_DATA_SHEET);

    let mut sheets = Map::new();
    for (title, json) in sheet_jsons {
        sheets.insert(title, json);
    }

    let mut body = Map::new();
    body.insert("sheets".to_string(), Value::Object(sheets));

    Ok(NormalizedContent {
        body: Value::Object(body),
        is_table: Some(is_table),
    })
}

/// Converts one sheet's value grid. `tableDataSheet` stays a raw grid;
/// every other sheet becomes row objects zipped against the header row,
/// with missing trailing cells as null.
fn sheet_to_json(file_title: &str, sheet_title: &str, grid: Vec<Vec<String>>) -> Value {
    let cleaned: Vec<Vec<String>> = grid
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| clean_raw(file_title, &cell))
                .collect()
        })
        .collect();

    if sheet_title == TABLE_DATA_SHEET {
        return Value::Array(
            cleaned
                .into_iter()
                .map(|row| Value::Array(row.into_iter().map(Value::String).collect()))
                .collect(),
        );
    }

    let mut rows = cleaned.into_iter();
    let headers: Vec<String> = match rows.next() {
        Some(header_row) => header_row,
        None => return Value::Array(Vec::new()),
    };

    let objects: Vec<Value> = rows
        .map(|row| {
            let mut obj = Map::new();
            for (i, header) in headers.iter().enumerate() {
                let cell = row.get(i).cloned().map(Value::String);
                obj.insert(header.clone(), cell.unwrap_or(Value::Null));
            }
            Value::Object(obj)
        })
        .collect();

    Value::Array(objects)
}
