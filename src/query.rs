//! The query seam. A full XQuery processor is a consumer of the engine; the
//! database only requires something that turns query text into bytes, with
//! access to documents by URI. The built-in processor resolves `doc("uri")`
//! calls and nothing else.

use crate::database::Database;
use crate::error::{Error, Result};

/// External query processor plugged into [`Database::execute_query`].
pub trait QueryProcessor: Send + Sync {
    fn execute(&self, db: &Database, query: &str) -> Result<Vec<u8>>;
}

/// Minimal built-in processor: evaluates `doc("uri")` to the content of the
/// addressed document.
pub(crate) struct DocFunction;

impl QueryProcessor for DocFunction {
    fn execute(&self, db: &Database, query: &str) -> Result<Vec<u8>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidArgument("empty query".to_owned()));
        }
        match parse_doc_call(query) {
            Some(uri) => db.document(uri)?.content_to_vec(),
            None => Err(Error::InvalidArgument(format!(
                "unsupported query: {:?} (only doc(\"uri\") is built in)",
                query
            ))),
        }
    }
}

fn parse_doc_call(query: &str) -> Option<&str> {
    let inner = query.strip_prefix("doc(")?.strip_suffix(')')?.trim();
    let uri = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))?;
    if uri.is_empty() {
        None
    } else {
        Some(uri)
    }
}
