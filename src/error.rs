use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database is not running")]
    NotRunning,
    #[error("database is already running at {0}")]
    AlreadyRunning(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no such resource: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid document {uri}: {reason}")]
    InvalidDocument { uri: String, reason: String },
    #[error("content store failure on {context}")]
    ContentStore {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog failure: {0}")]
    Catalog(String),
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps an I/O failure with the entity it happened on.
    pub(crate) fn store(context: impl Into<String>, source: std::io::Error) -> Error {
        Error::ContentStore { context: context.into(), source }
    }

    pub(crate) fn catalog(message: impl Into<String>) -> Error {
        Error::Catalog(message.into())
    }
}
