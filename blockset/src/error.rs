//! Error types and result definitions for block set operations.
//!
//! [`BlockSetError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source and the callsite where it was created. Errors of several
//! blocks can be aggregated into one value.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;
use std::panic::Location;
use std::sync::Arc;

use crate::connector::PipeError;

/// Result type for block set operations.
pub type BlockSetResult<T> = Result<T, BlockSetError>;

/// Payload stored for single [`BlockSetError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for block set operations.
#[derive(Debug, Clone)]
pub struct BlockSetError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, used when several blocks report unrelated failures.
    Many {
        errors: Vec<BlockSetError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised while validating, running or terminating a block set.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Validation Errors
    EmptyBlockSet,
    SourceDeclaresInput,
    SinkDeclaresOutput,
    InteriorBlockMissingHandle,

    // Block Execution Errors
    BlockFailed,
    BlockPanic,
    BlockSpawnFailed,
    BlockExitStatus,

    // Termination Errors
    BlockSetTerminated,
    BlockCancelled,

    // Pipe Errors
    PipeCancelled,
    PipeClosed,

    // State & Configuration Errors
    BlockSetAlreadyRun,
    ConfigError,

    // IO Errors
    IoError,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` for the kinds raised by topology validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::EmptyBlockSet
                | ErrorKind::SourceDeclaresInput
                | ErrorKind::SinkDeclaresOutput
                | ErrorKind::InteriorBlockMissingHandle
        )
    }

    /// Returns `true` for failures a block observes because a neighbour went away.
    ///
    /// A block seeing its pipe poisoned or closed is reacting to a failure elsewhere in the
    /// chain, so it is never reported as the origin of a failed run when another block failed
    /// for its own reasons.
    pub fn is_pipe_consequence(&self) -> bool {
        matches!(self, ErrorKind::PipeCancelled | ErrorKind::PipeClosed)
    }
}

impl BlockSetError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "Multiple errors occurred",
        }
    }

    /// Returns the detail of this error, or of the first aggregated error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    /// Returns the source as a [`BlockSetError`] when it is one.
    ///
    /// Failures surfaced by a block set wrap the failing block's own error, this gives access to
    /// it without walking the [`error::Error`] chain by hand.
    pub fn block_cause(&self) -> Option<&BlockSetError> {
        error::Error::source(self).and_then(|source| source.downcast_ref::<BlockSetError>())
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        BlockSetError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for BlockSetError {
    fn eq(&self, other: &BlockSetError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for BlockSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail:", detail)?;
                }

                if let Some(source) = payload.source.as_ref() {
                    write_indented(f, "Caused by:", &source.to_string())?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for BlockSetError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes a labelled block with every line indented under the label.
fn write_indented(f: &mut fmt::Formatter<'_>, label: &str, text: &str) -> fmt::Result {
    write!(f, "\n  {label}")?;
    for line in text.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for BlockSetError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> BlockSetError {
        BlockSetError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for BlockSetError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> BlockSetError {
        BlockSetError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned as is instead of being wrapped.
impl<E> From<Vec<E>> for BlockSetError
where
    E: Into<BlockSetError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> BlockSetError {
        let location = Location::caller();
        let mut errors: Vec<BlockSetError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            return errors.remove(0);
        }

        BlockSetError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`io::Error`] to [`BlockSetError`].
///
/// Errors produced by a poisoned or closed pipe map to [`ErrorKind::PipeCancelled`] and
/// [`ErrorKind::PipeClosed`] so they can be told apart from genuine I/O failures.
impl From<io::Error> for BlockSetError {
    #[track_caller]
    fn from(err: io::Error) -> BlockSetError {
        let pipe_error = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<PipeError>())
            .copied();

        let (kind, description) = match pipe_error {
            Some(PipeError::Cancelled) => (ErrorKind::PipeCancelled, "Pipe was cancelled"),
            Some(PipeError::Closed) => (ErrorKind::PipeClosed, "Pipe was closed by its reader"),
            None => (ErrorKind::IoError, "I/O operation failed"),
        };

        let detail = err.to_string();
        BlockSetError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts a failed join on a block task.
impl From<tokio::task::JoinError> for BlockSetError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> BlockSetError {
        let (kind, description) = if err.is_cancelled() {
            (ErrorKind::BlockCancelled, "Block task was cancelled")
        } else {
            (ErrorKind::BlockPanic, "Block task panicked")
        };

        let detail = err.to_string();
        BlockSetError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::shared::ValidationError> for BlockSetError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> BlockSetError {
        let detail = err.to_string();
        BlockSetError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid block set configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockset_error;

    #[test]
    fn test_single_error_creation() {
        let err = BlockSetError::from((ErrorKind::EmptyBlockSet, "Empty block set"));
        assert_eq!(err.kind(), ErrorKind::EmptyBlockSet);
        assert_eq!(err.description(), "Empty block set");
        assert_eq!(err.detail(), None);
    }

    #[test]
    fn test_error_with_detail() {
        let err = BlockSetError::from((
            ErrorKind::BlockFailed,
            "Block failed",
            "block 'tap' exited".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::BlockFailed);
        assert_eq!(err.detail(), Some("block 'tap' exited"));
    }

    #[test]
    fn test_single_element_vec_is_unwrapped() {
        let err = BlockSetError::from(vec![BlockSetError::from((
            ErrorKind::PipeClosed,
            "Pipe closed",
        ))]);
        assert_eq!(err.kinds(), vec![ErrorKind::PipeClosed]);
        assert!(!err.to_string().starts_with("[Many]"));
    }

    #[test]
    fn test_multiple_errors_are_aggregated() {
        let err = BlockSetError::from(vec![
            BlockSetError::from((ErrorKind::BlockFailed, "First")),
            BlockSetError::from((ErrorKind::BlockPanic, "Second")),
        ]);
        assert_eq!(err.kind(), ErrorKind::BlockFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::BlockFailed, ErrorKind::BlockPanic]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn test_source_is_exposed_as_block_cause() {
        let cause = blockset_error!(ErrorKind::IoError, "Read failed");
        let err = blockset_error!(
            ErrorKind::BlockFailed,
            "Block failed",
            "block 'target' failed",
            source: cause
        );

        assert_eq!(err.block_cause().map(|e| e.kind()), Some(ErrorKind::IoError));
        assert!(err.to_string().contains("Caused by:"));
    }

    #[test]
    fn test_pipe_io_errors_are_classified() {
        let cancelled = io::Error::new(io::ErrorKind::ConnectionAborted, PipeError::Cancelled);
        let closed = io::Error::new(io::ErrorKind::BrokenPipe, PipeError::Closed);
        let other = io::Error::new(io::ErrorKind::NotFound, "missing");

        assert_eq!(
            BlockSetError::from(cancelled).kind(),
            ErrorKind::PipeCancelled
        );
        assert_eq!(BlockSetError::from(closed).kind(), ErrorKind::PipeClosed);
        assert_eq!(BlockSetError::from(other).kind(), ErrorKind::IoError);
    }

    #[test]
    fn test_kind_groups() {
        assert!(ErrorKind::EmptyBlockSet.is_validation());
        assert!(ErrorKind::InteriorBlockMissingHandle.is_validation());
        assert!(!ErrorKind::BlockFailed.is_validation());

        assert!(ErrorKind::PipeClosed.is_pipe_consequence());
        assert!(ErrorKind::PipeCancelled.is_pipe_consequence());
        assert!(!ErrorKind::IoError.is_pipe_consequence());
    }
}
