//! Segment filename resolution.
//!
//! Live camera streams are published as a continuously appended list of
//! segment files. The forwarder names every segment
//! `<anything>_V<version digit><sequence digits>.<extension>`, where the
//! sequence is 1-based, so the stream-relative start of a segment is
//! `(sequence - 1) * segment_duration`.

use thiserror::Error;
use tracing::{trace, warn};

/// Marker separating the free-form prefix from the version and sequence.
const SEGMENT_MARKER: &str = "_V";

/// Container extension used by the stream forwarder.
pub const DEFAULT_CONTAINER_EXTENSION: &str = "ts";

/// Why a segment name could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// The name does not end with the container extension
    WrongContainer,
    /// The name lacks the version-and-sequence marker
    UnexpectedSource,
    /// The sequence digits are missing, not numeric, or zero
    InvalidSequence,
}

impl MalformedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MalformedReason::WrongContainer => {
                "expected proper container file but got something else"
            }
            MalformedReason::UnexpectedSource => "not from expected source",
            MalformedReason::InvalidSequence => "segment sequence is not a positive number",
        }
    }
}

/// Errors produced while resolving segment names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("{}: {}", .reason.as_str(), .name)]
    MalformedSegmentName {
        name: String,
        reason: MalformedReason,
    },
}

impl SegmentError {
    fn malformed(name: &str, reason: MalformedReason) -> Self {
        SegmentError::MalformedSegmentName {
            name: name.to_string(),
            reason,
        }
    }

    pub fn reason(&self) -> MalformedReason {
        match self {
            SegmentError::MalformedSegmentName { reason, .. } => *reason,
        }
    }
}

/// Resolved start of a segment, or the sentinel for names that could not be
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentStart {
    /// Stream-relative start time in seconds
    Known(f64),
    Unknown,
}

impl SegmentStart {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            SegmentStart::Known(secs) => Some(*secs),
            SegmentStart::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, SegmentStart::Known(_))
    }
}

/// Maps segment filenames to stream-relative start times.
#[derive(Debug, Clone)]
pub struct SegmentResolver {
    extension: String,
    segment_duration: f64,
}

impl SegmentResolver {
    /// Create a resolver for segments of `segment_duration` seconds.
    pub fn new(segment_duration: f64) -> Self {
        Self {
            extension: DEFAULT_CONTAINER_EXTENSION.to_string(),
            segment_duration,
        }
    }

    /// Use a different container extension (without the leading dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn segment_duration(&self) -> f64 {
        self.segment_duration
    }

    /// Parse a segment name into its start time.
    ///
    /// Accepts bare file names as well as URLs; any directory prefix and
    /// query string are ignored.
    pub fn parse(&self, name: &str) -> Result<f64, SegmentError> {
        let file = file_name(name);

        let stem = file
            .strip_suffix(self.extension.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .ok_or_else(|| SegmentError::malformed(name, MalformedReason::WrongContainer))?;

        let (_, tail) = stem
            .rsplit_once(SEGMENT_MARKER)
            .ok_or_else(|| SegmentError::malformed(name, MalformedReason::UnexpectedSource))?;

        // First character is the version digit.
        let mut chars = tail.chars();
        let sequence = match chars.next() {
            Some(version) if version.is_ascii_digit() => chars.as_str(),
            _ => return Err(SegmentError::malformed(name, MalformedReason::InvalidSequence)),
        };

        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SegmentError::malformed(name, MalformedReason::InvalidSequence));
        }

        let n: u64 = sequence
            .parse()
            .map_err(|_| SegmentError::malformed(name, MalformedReason::InvalidSequence))?;
        if n == 0 {
            return Err(SegmentError::malformed(name, MalformedReason::InvalidSequence));
        }

        let start = (n - 1) as f64 * self.segment_duration;
        trace!(segment = %name, sequence = n, start_secs = start, "Resolved segment start");
        Ok(start)
    }

    /// Resolve a segment name, logging a diagnostic instead of failing.
    pub fn resolve(&self, name: &str) -> SegmentStart {
        match self.parse(name) {
            Ok(start) => SegmentStart::Known(start),
            Err(e) => {
                warn!(segment = %name, error = %e, "Unable to resolve segment start");
                SegmentStart::Unknown
            }
        }
    }
}

fn file_name(name: &str) -> &str {
    let without_query = name.split(['?', '#']).next().unwrap_or(name);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
}
