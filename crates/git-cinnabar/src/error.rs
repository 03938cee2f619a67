use git_object::ObjectType;

/// Errors produced by the ingest engine.
///
/// Every variant is fatal: the command stream is assumed to originate from a
/// trusted driver that has already validated its own inputs, so anything
/// caught here indicates a bug upstream rather than a recoverable condition.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed chunk for node {node}: {reason}")]
    MalformedChunk { node: String, reason: String },

    #[error("delta base not found in hg2git: {node}")]
    DanglingDeltaBase { node: String },

    #[error("object {hex} does not have type {expected}")]
    TypeMismatch { expected: ObjectType, hex: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command {command} expected {expected} arguments, got {got}")]
    WrongArity {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("manifest diff boundary at offset {offset} is not aligned to a line start")]
    NonLineAlignedBoundary { offset: usize },

    #[error("diff part out of order: start {start} < previous end {previous_end}")]
    DiffPartOutOfOrder { start: usize, previous_end: usize },

    #[error("invalid hex id: {0}")]
    InvalidHex(String),

    #[error("unmapped hg id: {0}")]
    UnmappedHgId(String),

    #[error("object {hex} referenced but not found in the current session")]
    ObjectNotFound { hex: String },

    #[error(transparent)]
    Pack(#[from] git_pack::PackError),

    #[error(transparent)]
    Odb(#[from] git_odb::OdbError),

    #[error(transparent)]
    Object(#[from] git_object::ObjectError),

    #[error(transparent)]
    Hash(#[from] git_hash::HashError),

    #[error(transparent)]
    Ref(#[from] git_ref::RefError),

    #[error(transparent)]
    Date(#[from] git_utils::error::UtilError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
