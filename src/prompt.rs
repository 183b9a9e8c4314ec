//! Builds the instruction string sent to the model for each question.

use crate::table_store::StoredTable;

pub const PREVIEW_ROWS: usize = 5;

/// Assemble the single-turn user prompt: column list, aggregation rules, a
/// preview of the first rows, the real table binding, and the question.
pub fn build_prompt(table: &StoredTable, question: &str) -> String {
    let columns = table.columns().join(", ");
    let preview = format!("{}", table.df.head(Some(PREVIEW_ROWS)));

    format!(
        r#"You are an AI assistant that can answer questions about an uploaded data table.
The table is named "{table_name}" and has the following columns: {columns}.
When the user asks about the total number of items, total amount, or aggregate quantity, always use SUM(column_name).
When the user asks how many different items or records there are, use COUNT(*).
For example, "How many electronics items in stock?" means total stock units, so use SUM(Stock).
When referring to time periods or category filters (e.g., sales in June), apply the appropriate WHERE clause.

Here are the first {preview_rows} rows of the data:
{preview}

Question: {question}

Based on the table, provide a concise answer to the question, and a SQL query
that could be used to answer it. Always reference the table as "{table_name}"
in the FROM clause. Respond with JSON containing exactly two keys: "summary"
and "sql_query".

When the user asks for aggregated values grouped by categories (e.g., average
sales by region):
1. Give a clear, human-readable summary listing the aggregate value for each group separately, as bullet points.
2. Format numbers with thousands separators for readability.
3. Include the GROUP BY clause in the SQL query.

Example summary:
"The average sales in June by region were:
- North: $12,000
- South: $15,000
- West: $10,000
- East: $18,000"
"#,
        table_name = table.name,
        columns = columns,
        preview_rows = PREVIEW_ROWS,
        preview = preview,
        question = question,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    fn sample() -> StoredTable {
        StoredTable {
            name: "sales".to_string(),
            source_file: "sales.csv".to_string(),
            df: df![
                "region" => ["North", "South", "West", "East", "North", "South"],
                "amount" => [10, 20, 30, 40, 50, 60]
            ]
            .unwrap(),
        }
    }

    #[test]
    fn prompt_embeds_schema_and_question() {
        let prompt = build_prompt(&sample(), "What is the total amount?");
        assert!(prompt.contains("region, amount"));
        assert!(prompt.contains("Question: What is the total amount?"));
        assert!(prompt.contains(r#"named "sales""#));
        assert!(prompt.contains("SUM(column_name)"));
        assert!(prompt.contains("COUNT(*)"));
        assert!(prompt.contains("GROUP BY"));
    }

    #[test]
    fn preview_is_capped_at_five_rows() {
        let prompt = build_prompt(&sample(), "anything");
        // Six data rows in the fixture, only the first five may appear.
        assert!(prompt.contains("North"));
        assert!(!prompt.contains("60"));
    }
}
