//! SQL execution against the in-memory table via the polars SQL engine.

use crate::error::{AppError, Result};
use polars::prelude::*;
use polars::sql::SQLContext;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

/// Result-set cap applied to every query before collection.
pub const MAX_RESULT_ROWS: u32 = 10_000;

/// Placeholder identifiers models tend to emit in the FROM clause.
const PLACEHOLDER_TABLE_NAMES: [&str; 2] = ["table_name", "your_table"];

/// Execute `sql` with `df` registered under `table_name`. Engine errors come
/// back as [`AppError::Sql`] so they stay distinct from LLM failures.
pub fn run_sql(df: &DataFrame, table_name: &str, sql: &str) -> Result<DataFrame> {
    let mut ctx = SQLContext::new();
    ctx.register(table_name, df.clone().lazy());
    info!(table = table_name, sql, "executing SQL");
    let result = ctx
        .execute(sql)
        .map_err(|e| AppError::Sql(e.to_string()))?
        .limit(MAX_RESULT_ROWS)
        .collect()
        .map_err(|e| AppError::Sql(e.to_string()))?;
    Ok(result)
}

/// Replace placeholder table identifiers with the real binding, respecting
/// identifier boundaries so a column named `table_names` is left alone.
pub fn rewrite_placeholder(sql: &str, table_name: &str) -> String {
    let mut rewritten = sql.to_string();
    for placeholder in PLACEHOLDER_TABLE_NAMES {
        if placeholder == table_name {
            continue;
        }
        rewritten = replace_identifier(&rewritten, placeholder, table_name);
    }
    rewritten
}

fn replace_identifier(sql: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while let Some(pos) = sql[i..].find(from) {
        let start = i + pos;
        let end = start + from.len();
        let before_ok = !sql[..start]
            .chars()
            .next_back()
            .map_or(false, is_identifier_char);
        let after_ok = !sql[end..].chars().next().map_or(false, is_identifier_char);

        out.push_str(&sql[i..start]);
        out.push_str(if before_ok && after_ok { to } else { from });
        i = end;
    }
    out.push_str(&sql[i..]);
    out
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Render the first `limit` rows as JSON records for the response payload.
pub fn dataframe_to_rows(df: &DataFrame, limit: usize) -> Result<Vec<BTreeMap<String, Value>>> {
    let df_limited = df.head(Some(limit));
    let column_names: Vec<String> = df_limited
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut rows = Vec::with_capacity(df_limited.height());
    for row_idx in 0..df_limited.height() {
        let mut row_map = BTreeMap::new();
        for col_name in &column_names {
            let series = df_limited
                .column(col_name)
                .map_err(|e| AppError::Sql(e.to_string()))?;
            row_map.insert(col_name.clone(), series_value_to_json(series, row_idx)?);
        }
        rows.push(row_map);
    }
    Ok(rows)
}

fn series_value_to_json(series: &Series, row_idx: usize) -> Result<Value> {
    if series.is_null().get(row_idx).unwrap_or(false) {
        return Ok(Value::Null);
    }

    let any_val = series
        .get(row_idx)
        .map_err(|e| AppError::Sql(e.to_string()))?;

    let value = match series.dtype() {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => any_val
            .try_extract::<i64>()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => any_val
            .try_extract::<u64>()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        DataType::Float32 | DataType::Float64 => any_val
            .try_extract::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Boolean => match any_val {
            AnyValue::Boolean(b) => Value::Bool(b),
            _ => Value::Null,
        },
        DataType::String => match any_val.get_str() {
            Some(s) => Value::String(s.to_string()),
            None => Value::String(any_val.to_string()),
        },
        // Dates, datetimes and anything else go out as display strings.
        _ => Value::String(any_val.to_string()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_df() -> DataFrame {
        df![
            "region" => ["North", "South", "North"],
            "amount" => [10i64, 20, 30]
        ]
        .unwrap()
    }

    #[test]
    fn executes_aggregate_query() {
        let df = sample_df();
        let result = run_sql(&df, "sales", "SELECT SUM(amount) AS total FROM sales").unwrap();
        let total = result.column("total").unwrap().get(0).unwrap();
        assert_eq!(total.try_extract::<i64>().unwrap(), 60);
    }

    #[test]
    fn group_by_returns_one_row_per_group() {
        let df = sample_df();
        let result = run_sql(
            &df,
            "sales",
            "SELECT region, SUM(amount) AS total FROM sales GROUP BY region",
        )
        .unwrap();
        assert_eq!(result.height(), 2);
    }

    #[test]
    fn unknown_column_is_a_sql_error() {
        let df = sample_df();
        let err = run_sql(&df, "sales", "SELECT missing_col FROM sales").unwrap_err();
        assert!(matches!(err, AppError::Sql(_)));
    }

    #[test]
    fn placeholder_rewrite_respects_word_boundaries() {
        assert_eq!(
            rewrite_placeholder("SELECT * FROM table_name", "sales"),
            "SELECT * FROM sales"
        );
        assert_eq!(
            rewrite_placeholder("SELECT table_names FROM your_table", "sales"),
            "SELECT table_names FROM sales"
        );
        assert_eq!(
            rewrite_placeholder("SELECT * FROM sales", "sales"),
            "SELECT * FROM sales"
        );
    }

    #[test]
    fn rows_serialize_to_json_records() {
        let df = sample_df();
        let rows = dataframe_to_rows(&df, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], Value::String("North".to_string()));
        assert_eq!(rows[0]["amount"], Value::Number(10.into()));
    }
}
