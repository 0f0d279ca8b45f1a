//! Typed error used throughout the pipeline, with kinds matching the
//! abstract error taxonomy the pipeline is specified against.

use std::fmt;

/// Classification of an [`Error`], mirroring the failure modes the pipeline
/// is specified to distinguish.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed config file, or a derived invariant fails (e.g. a stream
    /// config where `t_min >= flush_buffer_size`). Fatal at startup.
    ConfigInvalid,
    /// A video/OTDET filename can't be parsed for hostname or timestamp.
    FilenameMalformed,
    /// Target artifact exists and overwrite is false.
    OutputExists,
    /// Unreadable source, unwritable destination, truncated artifact.
    IoFailure,
    /// Codec error, non-90-degree rotation angle, RTSP stream read failure
    /// beyond the reconnect threshold.
    DecodeFailure,
    /// Model load or inference error.
    DetectorFailure,
    /// A tracker-level invariant was violated; indicates a bug rather than
    /// bad input.
    TrackerInvariantViolated,
    /// An observer callback failed; always isolated, never propagated, but
    /// still representable as an `Error` for logging.
    ObserverFailure,
    /// Graceful shutdown was requested.
    Cancelled,
    /// Anything else, usually from a `?`-converted foreign error.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigInvalid => "config invalid",
            ErrorKind::FilenameMalformed => "filename malformed",
            ErrorKind::OutputExists => "output exists",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::DecodeFailure => "decode failure",
            ErrorKind::DetectorFailure => "detector failure",
            ErrorKind::TrackerInvariantViolated => "tracker invariant violated",
            ErrorKind::ObserverFailure => "observer failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type: an [`ErrorKind`] plus a message and an
/// optional chained source.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Renders this error together with every `source()` in its chain, one
    /// per line. Useful at top-level CLI error reporting.
    pub fn chain(&self) -> String {
        use std::fmt::Write;
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(c) = cause {
            write!(&mut out, "\ncaused by: {c}").unwrap();
            cause = c.source();
        }
        out
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("msg", &self.msg)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::with_source(ErrorKind::IoFailure, "I/O error", e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::with_source(ErrorKind::IoFailure, "JSON (de)serialization error", e)
    }
}

/// Extension methods for attaching a kind to a foreign `Result`.
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;

    /// Attaches a human-readable context message, defaulting to
    /// [`ErrorKind::IoFailure`] (the common case: file/artifact I/O).
    fn context(self, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::with_source(k, e.to_string(), e))
    }

    fn context(self, msg: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::with_source(ErrorKind::IoFailure, msg.into(), e))
    }
}

/// Builds and returns an [`Error`] without returning from the enclosing
/// function. Usage: `err!(DecodeFailure, msg("bad frame {}", no))` or
/// `err!(Unknown, source(e))`.
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+), source($src:expr) $(,)?) => {
        $crate::Error::with_source($crate::ErrorKind::$kind, format!($($arg)+), $src)
    };
    ($kind:ident, msg($($arg:tt)+) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($($arg)+))
    };
    ($kind:ident, source($src:expr) $(,)?) => {
        $crate::Error::with_source($crate::ErrorKind::$kind, $src.to_string(), $src)
    };
}

/// Like [`err!`] but returns immediately with `Err(...)`.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return Err($crate::err!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::new(ErrorKind::ConfigInvalid, "t_min >= flush buffer size");
        assert_eq!(
            e.to_string(),
            "config invalid: t_min >= flush buffer size"
        );
    }

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e = Error::with_source(ErrorKind::IoFailure, "opening otdet", io);
        let chain = e.chain();
        assert!(chain.contains("opening otdet"));
        assert!(chain.contains("no such file"));
    }

    #[test]
    fn err_macro_builds_kind() {
        let e = err!(DetectorFailure, msg("weights {} missing", "yolo.pt"));
        assert_eq!(e.kind(), ErrorKind::DetectorFailure);
        assert!(e.to_string().contains("yolo.pt"));
    }
}
