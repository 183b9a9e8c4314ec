//! tabletalk: ask natural-language questions about an uploaded CSV or Excel
//! file. Uploads are parsed into an in-memory polars DataFrame; questions are
//! answered by an OpenAI-compatible chat model whose SQL is executed locally
//! with the polars SQL engine.

pub mod answer;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod prompt;
pub mod sql_exec;
pub mod table_store;
