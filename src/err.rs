//! Error kinds shared by the query and export code.

/// Result type alias used throughout the worker.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by query planning, scanning, and export.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or contradictory query configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },
    /// Unknown field or type mismatch against the field schema.
    #[error("schema error for field {field:?}: {msg}")]
    Schema {
        /// Name of the offending field.
        field: String,
        /// Description of the problem.
        msg: String,
    },
    /// Missing array, row, contig, or sample.
    #[error("{what} not found: {name:?}")]
    NotFound {
        /// Kind of entity that was looked up.
        what: &'static str,
        /// The identifier that failed to resolve.
        name: String,
    },
    /// A cell violates the data invariants.
    #[error("data error at row {row}, column {column}: {msg}")]
    Data {
        /// Row coordinate of the offending cell.
        row: u64,
        /// Column coordinate of the offending cell.
        column: u64,
        /// Description of the violation.
        msg: String,
    },
    /// Underlying storage or file I/O failure.
    #[error("I/O error on {context}: {source}")]
    Io {
        /// Path or identifier the operation was working on.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Compression or decompression failure.
    #[error("codec error ({codec}): {msg}")]
    Codec {
        /// Name of the codec.
        codec: String,
        /// Description of the failure.
        msg: String,
    },
    /// Misuse of the API, e.g. double free or use after close.
    #[error("invalid state: {msg}")]
    State {
        /// Description of the misuse.
        msg: String,
    },
}

impl Error {
    /// Shorthand for a `Config` error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config { msg: msg.into() }
    }

    /// Shorthand for a `Schema` error.
    pub fn schema(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Schema {
            field: field.into(),
            msg: msg.into(),
        }
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Shorthand for a `Data` error.
    pub fn data(row: u64, column: u64, msg: impl Into<String>) -> Self {
        Error::Data {
            row,
            column,
            msg: msg.into(),
        }
    }

    /// Shorthand for an `Io` error with a path context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for a `Codec` error.
    pub fn codec(codec: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Codec {
            codec: codec.into(),
            msg: msg.into(),
        }
    }

    /// Shorthand for a `State` error.
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Error;

    #[test]
    fn error_messages_carry_identifiers() {
        assert_eq!(
            Error::not_found("sample", "NA12878").to_string(),
            "sample not found: \"NA12878\""
        );
        assert_eq!(
            Error::data(3, 1000, "END 999 precedes start").to_string(),
            "data error at row 3, column 1000: END 999 precedes start"
        );
    }
}
