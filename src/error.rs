use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("document has no root element")]
    Empty,
    #[error("root element must be <{expected}>, found <{found}>")]
    WrongRoot { expected: &'static str, found: String },
    #[error("unknown element <{0}>")]
    UnknownElement(String),
    #[error("<{element}> is missing attribute `{attribute}`")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("invalid value `{value}` for attribute `{attribute}`")]
    InvalidAttribute { attribute: &'static str, value: String },
    #[error("invalid hex byte `{0}`")]
    InvalidHex(String),
}

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("reference root node must be <Reference>")]
    MissingRoot,
    #[error("<Para type=\"{0}\"> declares unknown mutation `{1}`")]
    UnknownMutation(String, String),
    #[error("<Para type=\"{0}\"> has min greater than max")]
    InvertedRange(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("exchange task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("device config has no <Target> root")]
    MissingTarget,
    #[error("invalid monitor pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown monitor mode `{0}`")]
    UnknownMode(String),
}

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session log error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("device restart failed and no retry path remains")]
    Restart,
    #[error("initial exchange with the target failed: {0}")]
    Init(String),
    #[error("session log holds no rounds to replay")]
    EmptyLog,
}

impl FuzzError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FuzzError::Io {
            path: path.into(),
            source,
        }
    }
}
