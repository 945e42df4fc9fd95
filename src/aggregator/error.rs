use thiserror::Error;

/// Errors raised while compiling field specifications into a view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("empty field definition")]
    EmptyDefinition,

    #[error("cannot find field \"{0}\"")]
    UnknownField(String),

    #[error("unsupported data type of element \"{0}\"")]
    UnsupportedType(String),

    #[error("alias \"{0}\" has no known source elements")]
    EmptyAlias(String),

    #[error("cannot get common data type for alias fields of \"{0}\"")]
    IncompatibleAlias(String),

    #[error("invalid aggregate field \"{0}\"")]
    InvalidAggregate(String),

    #[error("invalid aggregation function \"{func}\" in \"{def}\"")]
    InvalidFunction { func: String, def: String },

    #[error("invalid arguments of \"{def}\": {reason}")]
    InvalidArguments { def: String, reason: String },

    #[error("in/out fields \"{0}\" have different data types")]
    InOutMismatch(String),

    #[error("cannot find order field \"{0}\"")]
    UnknownOrderField(String),

    #[error("invalid order direction in \"{0}\"")]
    InvalidOrderDirection(String),
}
