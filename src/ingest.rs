//! Upload ingestion: bytes + filename in, parsed table out.
//!
//! Dispatches on the file extension: `.csv` goes through the polars CSV
//! reader, `.xls`/`.xlsx` through calamine with a small column-type inference
//! pass. A parse that yields zero data rows counts as a failure.

use crate::error::{AppError, Result};
use crate::table_store::{StoredTable, TableStore};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use polars::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tracing::{info, warn};

/// Parse an uploaded file into a [`StoredTable`]. Does not touch the store.
pub fn ingest_upload(filename: &str, bytes: &[u8]) -> Result<StoredTable> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let df = match extension.as_deref() {
        Some("csv") => parse_csv(bytes)?,
        Some("xls") | Some("xlsx") => parse_excel(bytes)?,
        _ => return Err(AppError::UnsupportedFormat),
    };

    if df.height() == 0 {
        return Err(AppError::EmptyTable);
    }

    Ok(StoredTable {
        name: table_name_from_filename(filename),
        source_file: filename.to_string(),
        df,
    })
}

/// Ingest an upload and apply the outcome to the store.
///
/// On success the store is replaced. Parse and empty-table failures clear it;
/// an unsupported extension leaves whatever was there untouched.
pub fn apply_upload(store: &TableStore, filename: &str, bytes: &[u8]) -> Result<String> {
    match ingest_upload(filename, bytes) {
        Ok(table) => {
            info!(
                file = filename,
                table = %table.name,
                rows = table.df.height(),
                "upload parsed"
            );
            store.set(table);
            Ok(format!("Successfully uploaded and parsed {}", filename))
        }
        Err(AppError::UnsupportedFormat) => Err(AppError::UnsupportedFormat),
        Err(e) => {
            warn!(file = filename, error = %e, "upload failed, clearing stored table");
            store.clear();
            Err(e)
        }
    }
}

fn parse_csv(bytes: &[u8]) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(1000))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()
        .map_err(|e| AppError::Parse(e.to_string()))
}

fn parse_excel(bytes: &[u8]) -> Result<DataFrame> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| AppError::Parse(e.to_string()))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Parse("workbook has no worksheets".to_string()))?
        .map_err(|e| AppError::Parse(e.to_string()))?;

    let rows: Vec<Vec<Data>> = range.rows().map(|r| r.to_vec()).collect();
    if rows.is_empty() {
        return Err(AppError::EmptyTable);
    }

    let headers: Vec<String> = rows[0]
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let header = calamine::DataType::as_string(cell).unwrap_or_default();
            if header.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                header
            }
        })
        .collect();

    let mut series_vec = Vec::with_capacity(headers.len());
    for (col_idx, header) in headers.iter().enumerate() {
        let cells: Vec<Option<&Data>> = rows[1..].iter().map(|row| row.get(col_idx)).collect();
        let inferred = infer_column_type(&cells);
        series_vec.push(column_to_series(header, &cells, inferred));
    }

    DataFrame::new(series_vec).map_err(|e| AppError::Parse(e.to_string()))
}

enum ExcelColType {
    Int64,
    Float64,
    Boolean,
    Utf8,
}

/// One pass over the column: any string (or date) cell makes it a string
/// column, floats beat ints, ints beat bools.
fn infer_column_type(cells: &[Option<&Data>]) -> ExcelColType {
    use calamine::DataType as CalamineTrait;
    let mut has_float = false;
    let mut has_int = false;
    let mut has_bool = false;
    for cell in cells.iter().flatten() {
        if CalamineTrait::is_empty(*cell) {
            continue;
        }
        if CalamineTrait::is_float(*cell) {
            has_float = true;
        } else if CalamineTrait::is_int(*cell) {
            has_int = true;
        } else if CalamineTrait::is_bool(*cell) {
            has_bool = true;
        } else {
            return ExcelColType::Utf8;
        }
    }
    if has_float {
        ExcelColType::Float64
    } else if has_int {
        ExcelColType::Int64
    } else if has_bool {
        ExcelColType::Boolean
    } else {
        ExcelColType::Utf8
    }
}

fn column_to_series(name: &str, cells: &[Option<&Data>], col_type: ExcelColType) -> Series {
    use calamine::DataType as CalamineTrait;
    match col_type {
        ExcelColType::Int64 => {
            let v: Vec<Option<i64>> = cells
                .iter()
                .map(|c| c.and_then(|cell| CalamineTrait::as_i64(cell)))
                .collect();
            Series::new(name, v)
        }
        ExcelColType::Float64 => {
            let v: Vec<Option<f64>> = cells
                .iter()
                .map(|c| c.and_then(|cell| CalamineTrait::as_f64(cell)))
                .collect();
            Series::new(name, v)
        }
        ExcelColType::Boolean => {
            let v: Vec<Option<bool>> = cells
                .iter()
                .map(|c| c.and_then(|cell| CalamineTrait::get_bool(cell)))
                .collect();
            Series::new(name, v)
        }
        ExcelColType::Utf8 => {
            let v: Vec<Option<String>> = cells
                .iter()
                .map(|c| c.and_then(|cell| cell_to_string(cell)))
                .collect();
            Series::new(name, v)
        }
    }
}

fn cell_to_string(cell: &Data) -> Option<String> {
    use calamine::DataType as CalamineTrait;
    if CalamineTrait::is_empty(cell) {
        return None;
    }
    if let Some(dt) = CalamineTrait::as_datetime(cell) {
        return Some(dt.to_string());
    }
    CalamineTrait::as_string(cell)
}

/// Derive the SQL binding name from the upload's file stem: lowercase,
/// non-alphanumerics collapsed to underscores, leading digit prefixed.
pub fn table_name_from_filename(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("uploaded_data");

    let mut name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if name.trim_matches('_').is_empty() {
        return "uploaded_data".to_string();
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert_str(0, "t_");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trips_columns() {
        let table = ingest_upload("sales.csv", b"region,amount\nNorth,10\nSouth,20\n").unwrap();
        assert_eq!(table.name, "sales");
        assert_eq!(table.columns(), vec!["region", "amount"]);
        assert_eq!(table.df.height(), 2);
    }

    #[test]
    fn rejects_unknown_extension() {
        let err = ingest_upload("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let table = ingest_upload("SALES.CSV", b"a,b\n1,2\n").unwrap();
        assert_eq!(table.df.height(), 1);
    }

    #[test]
    fn header_only_csv_is_empty() {
        let err = ingest_upload("empty.csv", b"region,amount\n").unwrap_err();
        assert!(matches!(err, AppError::EmptyTable));
    }

    #[test]
    fn malformed_excel_is_a_parse_error() {
        let err = ingest_upload("junk.xlsx", b"definitely not a zip archive").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(table_name_from_filename("Q3 Sales (final).csv"), "q3_sales__final_");
        assert_eq!(table_name_from_filename("2024.csv"), "t_2024");
        assert_eq!(table_name_from_filename("___.csv"), "uploaded_data");
        assert_eq!(table_name_from_filename("inventory.xlsx"), "inventory");
    }
}
