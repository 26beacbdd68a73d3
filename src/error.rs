use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("collection '{collection}' is unavailable: {reason}")]
    Unavailable { collection: String, reason: String },

    #[error("document {id} not found in '{collection}'")]
    NotFound { collection: String, id: Uuid },

    #[error("malformed document in '{collection}': {reason}")]
    Malformed { collection: String, reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("no unit collection could be fetched ({failed} failed)")]
    NothingFetched { failed: usize },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("spreadsheet generation failed: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),

    #[error("could not write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not open print preview: {0}")]
    Preview(String),
}
