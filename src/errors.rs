use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing value for argument: {flag}")]
    MissingValue { flag: String },
    #[error("missing required argument: {field}")]
    MissingRequired { field: String },
    #[error("invalid value for {flag}={value}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("unsupported argument: {arg}")]
    UnsupportedArgument { arg: String },
    #[error("rejected argument {token}: {reason}")]
    ArgRejected { token: String, reason: String },
    #[error("required external tool not found in PATH: {tool}")]
    ToolMissing { tool: String },
    #[error("{tool} versions 0.* are unsupported (found \"{version}\")")]
    ToolVersionRejected { tool: String, version: String },
    #[error("failed to probe {tool}: {reason}")]
    ToolProbeFailed { tool: String, reason: String },
    #[error("failed to set up FIFO at {path}: {reason}")]
    FifoSetup { path: String, reason: String },
    #[error("command failed: {command} (exit: {code:?}) stderr: {stderr}")]
    SubprocessFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("parse error: {message}")]
    ParseError { message: String },
    #[error("aborted after a failure elsewhere in the worker pool")]
    Aborted,
    #[error("alignment read/write error: {0}")]
    Bam(#[from] rust_htslib::errors::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn is_abort(&self) -> bool {
        matches!(self, AppError::Aborted)
    }
}
