use std::borrow::Cow;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to tag errors with the information needed to classify them.
///
/// The msg is conveyed back to the job manager (e.g. in an alloc-deny note)
/// if it makes it that far.
///
/// The short_msg is used as a tag - available for tests and for log
/// matching - that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error kind associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg SpanNotFound
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    /// Eg "no span with id 42 exists in this planner"
    pub msg: Cow<'static, str>,
}

/// The error kinds a queue, planner, or matcher operation can surface.
/// These are deliberately transport-agnostic: the callback layer decides
/// per kind whether to deny, defer, log, or propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed input: null where required, bad duration, unparsable
    /// parameter.
    InvalidArgument,
    /// Numeric overflow, negative remaining, depth beyond limits.
    OutOfRange,
    /// Unknown job id, span id, resource type, or queue.
    NotFound,
    /// Duplicate span id, pending-key, or queue name.
    AlreadyExists,
    /// The matcher cannot satisfy the request right now.
    ResourceBusy,
    /// The matcher can never satisfy the request under current topology.
    Unsatisfiable,
    /// Inconsistency between matcher and queue state.
    ProtocolViolation,
    /// Allocation failure. Never swallowed; fatal to the current loop.
    OutOfMemory,
}

impl ErrorMetadata {
    /// Malformed input. The short_msg should be CapitalCamelCased,
    /// describing the error (eg BadPlanDuration). The msg should be a
    /// descriptive message targeted toward the developer.
    pub fn invalid_argument(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidArgument,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Numeric input outside the representable or administrative range.
    pub fn out_of_range(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::OutOfRange,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found (eg SpanNotFound, UnknownQueue).
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// An entry with the same key already exists.
    pub fn already_exists(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::AlreadyExists,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The request cannot be satisfied right now but may be satisfiable
    /// after a resource-state change.
    pub fn resource_busy(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ResourceBusy,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The request can never be satisfied under the current topology.
    pub fn unsatisfiable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unsatisfiable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Matcher and queue state disagree (eg a full removal reported before
    /// the final release).
    pub fn protocol_violation(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ProtocolViolation,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Allocation failure surfaced as-is.
    pub fn out_of_memory() -> Self {
        Self {
            code: ErrorCode::OutOfMemory,
            short_msg: "OutOfMemory".into(),
            msg: "allocation failure".into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.code == ErrorCode::InvalidArgument
    }

    pub fn is_out_of_range(&self) -> bool {
        self.code == ErrorCode::OutOfRange
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == ErrorCode::AlreadyExists
    }

    pub fn is_resource_busy(&self) -> bool {
        self.code == ErrorCode::ResourceBusy
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.code == ErrorCode::Unsatisfiable
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.code == ErrorCode::ProtocolViolation
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.code == ErrorCode::OutOfMemory
    }

    /// True for errors that indicate a fault in the request itself rather
    /// than in the current resource state. These are safe to reject
    /// permanently and to cache.
    pub fn is_deterministic_request_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::InvalidArgument
                | ErrorCode::OutOfRange
                | ErrorCode::NotFound
                | ErrorCode::AlreadyExists
                | ErrorCode::Unsatisfiable
        )
    }
}

const UNCLASSIFIED: &str = "Unclassified";
const UNCLASSIFIED_MSG: &str = "unclassified internal error";

pub trait ErrorMetadataAnyhowExt {
    fn is_invalid_argument(&self) -> bool;
    fn is_out_of_range(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_already_exists(&self) -> bool;
    fn is_resource_busy(&self) -> bool;
    fn is_unsatisfiable(&self) -> bool;
    fn is_protocol_violation(&self) -> bool;
    fn is_out_of_memory(&self) -> bool;
    fn is_deterministic_request_error(&self) -> bool;
    fn error_code(&self) -> Option<ErrorCode>;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as InvalidArgument
    fn is_invalid_argument(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_invalid_argument();
        }
        false
    }

    /// Returns true if error is tagged as OutOfRange
    fn is_out_of_range(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_out_of_range();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as AlreadyExists
    fn is_already_exists(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_already_exists();
        }
        false
    }

    /// Returns true if error is tagged as ResourceBusy
    fn is_resource_busy(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_resource_busy();
        }
        false
    }

    /// Returns true if error is tagged as Unsatisfiable
    fn is_unsatisfiable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_unsatisfiable();
        }
        false
    }

    /// Returns true if error is tagged as ProtocolViolation
    fn is_protocol_violation(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_protocol_violation();
        }
        false
    }

    /// Returns true if error is tagged as OutOfMemory
    fn is_out_of_memory(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_out_of_memory();
        }
        false
    }

    fn is_deterministic_request_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_deterministic_request_error();
        }
        false
    }

    /// Return the classified code, if this chain carries one.
    fn error_code(&self) -> Option<ErrorCode> {
        self.downcast_ref::<ErrorMetadata>().map(|e| e.code)
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        UNCLASSIFIED
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        UNCLASSIFIED_MSG
    }

    /// If there's ErrorMetadata attached, map it with the given function,
    /// preserving the rest of the chain.
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self {
        match self.downcast_ref::<ErrorMetadata>() {
            Some(e) => {
                let mapped = f(e.clone());
                self.context(mapped)
            },
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_op() -> anyhow::Result<()> {
        anyhow::bail!(ErrorMetadata::not_found(
            "SpanNotFound",
            "no span with id 42 exists in this planner"
        ))
    }

    #[test]
    fn test_classification_survives_context() -> anyhow::Result<()> {
        let err = failing_op()
            .map_err(|e| e.context("while removing a span"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_resource_busy());
        assert_eq!(err.short_msg(), "SpanNotFound");
        assert_eq!(err.error_code(), Some(ErrorCode::NotFound));
        Ok(())
    }

    #[test]
    fn test_unclassified_error() {
        let err = anyhow::anyhow!("plain");
        assert_eq!(err.error_code(), None);
        assert_eq!(err.short_msg(), "Unclassified");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_map_error_metadata() {
        let err = failing_op().unwrap_err();
        let remapped = err.map_error_metadata(|e| ErrorMetadata {
            code: ErrorCode::ProtocolViolation,
            ..e
        });
        assert!(remapped.is_protocol_violation());
    }
}
