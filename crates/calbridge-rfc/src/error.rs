use thiserror::Error;

/// RFC layer errors
#[derive(Error, Debug)]
pub enum RfcError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error("Missing property: {0}")]
    MissingProperty(&'static str),

    #[error("Invalid value for {property}: {value}")]
    InvalidValue { property: &'static str, value: String },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
}

pub type RfcResult<T> = std::result::Result<T, RfcError>;
