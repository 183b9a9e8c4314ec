use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unsupported file format")]
    UnsupportedFormat,

    #[error("The uploaded file is empty or malformed.")]
    EmptyTable,

    #[error("Failed to parse file: {0}")]
    Parse(String),

    #[error("Please upload a file first.")]
    NoTable,

    #[error("No question provided.")]
    NoQuestion,

    #[error("Error with AI model: {0}")]
    Llm(String),

    #[error("SQL execution error: {0}")]
    Sql(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<polars::error::PolarsError> for AppError {
    fn from(err: polars::error::PolarsError) -> Self {
        AppError::Sql(err.to_string())
    }
}

impl AppError {
    /// HTTP status for the error payload. Input-validation failures are 400,
    /// everything upstream (parser, LLM, SQL engine) is 500.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UnsupportedFormat
            | AppError::EmptyTable
            | AppError::NoTable
            | AppError::NoQuestion => 400,
            AppError::Parse(_)
            | AppError::Llm(_)
            | AppError::Sql(_)
            | AppError::Io(_)
            | AppError::Json(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
