//! Parse-level error types.

use thiserror::Error;

/// Errors raised while normalizing or parsing a single G-code line.
///
/// Every variant rejects the block and leaves machine state untouched; the
/// controller reports the error and continues with the next line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line could not be interpreted as a sequence of G-code words.
    #[error("invalid or malformed command: {0}")]
    InvalidOrMalformedCommand(String),

    /// A word value failed numeric conversion.
    #[error("bad number format in word '{0}'")]
    BadNumberFormat(String),

    /// A structurally valid G-word that this dialect does not implement.
    #[error("G{0} command unsupported")]
    GcodeCommandUnsupported(String),

    /// A structurally valid M-word that this dialect does not implement.
    #[error("M{0} command unsupported")]
    McodeCommandUnsupported(String),

    /// Two words from the same modal group appeared in one block.
    #[error("modal group violation: {0}")]
    ModalGroupViolation(&'static str),

    /// A command that requires axis words received none.
    #[error("required axis word is missing")]
    AxisIsMissing,

    /// A `*NN` checksum was present but the line carries no `N` word.
    #[error("checksum present without line number")]
    MissingLineNumberWithChecksum,

    /// The transmitted checksum did not match the computed one.
    #[error("checksum match failed: computed {computed}, received {received}")]
    ChecksumMatchFailed { computed: u8, received: u8 },

    /// Input line exceeded the maximum accepted length.
    #[error("input line exceeds {0} bytes")]
    LineOverflow(usize),
}
