use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    Module,
    UnsupportedAbi,
    OutOfMemory,
    MemoryDecode,
    GeneratorExecution,
    InvalidDeployArgs,
    InvalidGeneratorOutput,
    EnvelopeDecode,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    offset: Option<u64>,
    raw: Option<Vec<u8>>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            offset: None,
            raw: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Offending bytes attached to output-shape errors.
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_raw(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn with_boxed_source(mut self, source: Box<dyn StdError + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        if let Some(raw) = &self.raw {
            write!(f, " (raw: {} bytes)", raw.len())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::Module => 4,
        ErrorKind::UnsupportedAbi => 5,
        ErrorKind::OutOfMemory => 6,
        ErrorKind::MemoryDecode => 7,
        ErrorKind::GeneratorExecution => 8,
        ErrorKind::InvalidDeployArgs => 9,
        ErrorKind::InvalidGeneratorOutput => 10,
        ErrorKind::EnvelopeDecode => 11,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Io, 3),
            (ErrorKind::Module, 4),
            (ErrorKind::UnsupportedAbi, 5),
            (ErrorKind::OutOfMemory, 6),
            (ErrorKind::MemoryDecode, 7),
            (ErrorKind::GeneratorExecution, 8),
            (ErrorKind::InvalidDeployArgs, 9),
            (ErrorKind::InvalidGeneratorOutput, 10),
            (ErrorKind::EnvelopeDecode, 11),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::InvalidGeneratorOutput)
            .with_message("amount is negative")
            .with_offset(1024)
            .with_raw(vec![0xa1, 0x00]);
        let text = err.to_string();
        assert!(text.starts_with("InvalidGeneratorOutput: amount is negative"));
        assert!(text.contains("(offset: 1024)"));
        assert!(text.contains("(raw: 2 bytes)"));
        assert_eq!(err.raw(), Some(&[0xa1, 0x00][..]));
    }
}
