//! The question-answering pipeline: prompt, LLM call, reply extraction,
//! placeholder rewrite, SQL execution, response assembly.

use crate::error::{AppError, Result};
use crate::llm::{extract_model_reply, LlmClient};
use crate::prompt::build_prompt;
use crate::sql_exec::{dataframe_to_rows, rewrite_placeholder, run_sql};
use crate::table_store::TableStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Response payload for `/ask`.
#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub summary: String,
    pub sql_query: String,
    pub full_result: Vec<BTreeMap<String, Value>>,
}

/// Answer one question against the currently stored table.
///
/// The table precondition is checked before the question so "upload a file
/// first" wins regardless of question content. One LLM attempt, no retries;
/// SQL engine failures surface as [`AppError::Sql`], distinct from LLM errors.
pub async fn answer_question(
    store: &TableStore,
    llm: &LlmClient,
    question: &str,
) -> Result<AskResponse> {
    let table = store.snapshot().ok_or(AppError::NoTable)?;
    let question = question.trim();
    if question.is_empty() {
        return Err(AppError::NoQuestion);
    }

    info!(table = %table.name, question, "answering question");
    let prompt = build_prompt(&table, question);
    let completion = llm.ask(&prompt).await?;
    let reply = extract_model_reply(&completion)?;

    let sql_query = rewrite_placeholder(reply.sql_query.trim(), &table.name);
    let full_result = if sql_query.is_empty() {
        Vec::new()
    } else {
        let result_df = run_sql(&table.df, &table.name, &sql_query).inspect_err(|e| {
            warn!(sql = %sql_query, error = %e, "SQL execution failed");
        })?;
        dataframe_to_rows(&result_df, result_df.height())?
    };

    Ok(AskResponse {
        summary: reply.summary,
        sql_query,
        full_result,
    })
}
