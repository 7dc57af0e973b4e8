use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand, ValueEnum};
use log::error;
use serde::Serialize;
use xantippe::{
    Database, Error, IndexType, Inheritable, Key, MediaType, Result, Value,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Embedded hierarchical XML document database", long_about = None)]
struct Opts {
    /// Database directory; falls back to $XANTIPPE_DB
    #[arg(long)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a collection (and any missing ancestors)
    Mkcol { uri: String },
    /// Store a file as a document
    Put { uri: String, file: PathBuf },
    /// Write a document's content to stdout
    Get { uri: String },
    /// List the children of a collection
    Ls { uri: String },
    /// Delete a document or a collection subtree
    Rm { uri: String },
    /// Define an index on a collection
    IndexAdd {
        collection: String,
        name: String,
        path: String,
        #[arg(value_enum, default_value_t = KeyType::String)]
        value_type: KeyType,
    },
    /// Find documents by typed keys, e.g. --key DocumentId:integer=2
    Find {
        collection: String,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        recursive: bool,
    },
    /// Run query text through the configured processor
    Query { text: String },
    /// Toggle compression for a collection
    Compress {
        collection: String,
        #[arg(value_enum)]
        mode: CompressionArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum KeyType {
    String,
    Integer,
    Long,
    Float,
    Double,
    Date,
}

impl From<KeyType> for IndexType {
    fn from(value: KeyType) -> IndexType {
        match value {
            KeyType::String => IndexType::String,
            KeyType::Integer => IndexType::Integer,
            KeyType::Long => IndexType::Long,
            KeyType::Float => IndexType::Float,
            KeyType::Double => IndexType::Double,
            KeyType::Date => IndexType::Date,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum CompressionArg {
    None,
    Deflate,
    Inherit,
}

#[derive(Serialize)]
struct FoundDocument {
    uri: String,
    id: u32,
    media_type: MediaType,
}

#[derive(Serialize)]
struct Listing<'a> {
    kind: &'a str,
    name: String,
}

fn main() {
    env_logger::init();
    let opts = Opts::parse();
    if let Err(e) = run(opts) {
        error!("{}", e);
        exit(1)
    }
}

fn run(opts: Opts) -> Result<()> {
    let dir = opts
        .dir
        .or_else(|| env::var_os("XANTIPPE_DB").map(PathBuf::from))
        .ok_or_else(|| {
            Error::InvalidArgument("no database directory: pass --dir or set XANTIPPE_DB".into())
        })?;
    let db = Database::open(dir);
    db.start()?;
    let outcome = dispatch(&db, opts.command);
    db.shutdown()?;
    outcome
}

fn dispatch(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Mkcol { uri } => {
            let mut current = db.root()?;
            for segment in uri.split('/').filter(|s| !s.is_empty()) {
                current = match current.collection(segment) {
                    Ok(child) => child,
                    Err(Error::NotFound(_)) => current.create_collection(segment)?,
                    Err(e) => return Err(e),
                };
            }
            println!("{}", current.uri()?);
            Ok(())
        }
        Command::Put { uri, file } => {
            let (collection, name) = split_document_uri(&uri)?;
            let collection = db.collection(collection)?;
            let doc = match collection.document(name) {
                Ok(doc) => doc,
                Err(Error::NotFound(_)) => collection.create_document(name)?,
                Err(e) => return Err(e),
            };
            doc.set_content(&file)?;
            println!("{} ({} bytes stored)", doc.uri()?, doc.stored_length()?);
            Ok(())
        }
        Command::Get { uri } => {
            let mut content = db.document(&uri)?.content()?;
            let stdout = io::stdout();
            io::copy(&mut content, &mut stdout.lock())?;
            Ok(())
        }
        Command::Ls { uri } => {
            let collection = db.collection(&uri)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for child in collection.collections()? {
                print_json(&mut out, &Listing { kind: "collection", name: child.name()? })?;
            }
            for doc in collection.documents()? {
                print_json(&mut out, &Listing { kind: "document", name: doc.name()? })?;
            }
            Ok(())
        }
        Command::Rm { uri } => {
            let (parent, name) = split_document_uri(&uri)?;
            let parent = db.collection(parent)?;
            if db.is_document(&uri)? {
                parent.delete_document(name)
            } else {
                parent.delete_collection(name)
            }
        }
        Command::IndexAdd { collection, name, path, value_type } => {
            db.collection(&collection)?.add_index(&name, &path, value_type.into())
        }
        Command::Find { collection, keys, recursive } => {
            let keys = keys.iter().map(|raw| parse_key(raw)).collect::<Result<Vec<_>>>()?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for doc in db.collection(&collection)?.find_documents(&keys, recursive)? {
                print_json(
                    &mut out,
                    &FoundDocument {
                        uri: doc.uri()?,
                        id: doc.id(),
                        media_type: doc.media_type()?,
                    },
                )?;
            }
            Ok(())
        }
        Command::Query { text } => {
            let mut result = db.execute_query(&text)?;
            let mut bytes = Vec::new();
            result.read_to_end(&mut bytes)?;
            io::stdout().write_all(&bytes)?;
            Ok(())
        }
        Command::Compress { collection, mode } => {
            let mode = match mode {
                CompressionArg::None => Inheritable::Set(xantippe::CompressionMode::None),
                CompressionArg::Deflate => Inheritable::Set(xantippe::CompressionMode::Deflate),
                CompressionArg::Inherit => Inheritable::Inherit,
            };
            db.collection(&collection)?.set_compression_mode(mode)
        }
    }
}

/// Splits `/a/b/doc` into the collection part and the document name.
fn split_document_uri(uri: &str) -> Result<(&str, &str)> {
    let trimmed = uri.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) if !name.is_empty() => Ok(("/", name)),
        Some((collection, name)) if !name.is_empty() => Ok((collection, name)),
        _ => Err(Error::InvalidArgument(format!("uri {:?} names no resource", uri))),
    }
}

/// Parses `name=value` or `name:type=value` into a typed key; the type
/// defaults to string.
fn parse_key(raw: &str) -> Result<Key> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::InvalidArgument(format!("key {:?} is not name=value", raw)))?;
    let (name, key_type) = match name.split_once(':') {
        Some((name, type_name)) => {
            let key_type = KeyType::from_str(type_name, true).map_err(|_| {
                Error::InvalidArgument(format!("unknown key type {:?}", type_name))
            })?;
            (name, key_type)
        }
        None => (name, KeyType::String),
    };
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!("key {:?} has no name", raw)));
    }
    let value = Value::coerce(value, key_type.into())
        .ok_or_else(|| Error::InvalidArgument(format!("value {:?} is not a {:?}", value, key_type)))?;
    Ok(Key::new(name, value))
}

fn print_json(out: &mut impl Write, value: &impl Serialize) -> Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| Error::InvalidArgument(format!("cannot encode output: {}", e)))?;
    writeln!(out, "{}", line)?;
    Ok(())
}
