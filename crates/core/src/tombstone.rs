//! Failure records.
//!
//! A [`Tombstone`] stands in for an item whose data could not be fetched. It
//! carries a [`ProcessingError`] describing which step failed, how often it
//! was attempted and what the underlying causes were.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The discovery step that produced a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStep {
    DigitalTwinRequest,
    SubmodelRequest,
    SchemaValidation,
    SchemaRequest,
    UsagePolicyValidation,
    DataIntegrityCheck,
    BpdmRequest,
}

/// A failure reduced to data: a kind, a message, an optional cause and any
/// failures suppressed alongside it.
///
/// Errors from parallel attempts (e.g. racing several registries) are kept
/// in `suppressed`, so one failure can fan out into several root causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCause {
    pub kind: String,
    pub message: String,
    pub cause: Option<Box<ErrorCause>>,
    pub suppressed: Vec<ErrorCause>,
}

impl ErrorCause {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// Convert any error and its `source()` chain.
    ///
    /// The outer error is labelled with its type name; sources are only
    /// reachable as trait objects and are labelled `Error`.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let mut cause = Self::new(short_type_name::<E>(), err.to_string());
        cause.cause = err.source().map(|s| Box::new(Self::from_source(s)));
        cause
    }

    fn from_source(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut cause = Self::new("Error", err.to_string());
        cause.cause = err.source().map(|s| Box::new(Self::from_source(s)));
        cause
    }

    pub fn caused_by(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_suppressed(mut self, suppressed: Vec<ErrorCause>) -> Self {
        self.suppressed = suppressed;
        self
    }

    /// Follow the cause chain to its deepest element.
    pub fn root(&self) -> &ErrorCause {
        let mut current = self;
        while let Some(next) = current.cause.as_deref() {
            current = next;
        }
        current
    }

    /// `"<kind>: <message>"`.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

/// Conversion into an [`ErrorCause`] tree.
pub trait ToErrorCause {
    fn to_error_cause(&self) -> ErrorCause;
}

impl ToErrorCause for ErrorCause {
    fn to_error_cause(&self) -> ErrorCause {
        self.clone()
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Root-cause messages of a set of suppressed failures.
///
/// For each failure the deepest cause is taken. If that root itself carries
/// suppressed failures, those are expanded instead.
pub fn root_error_messages(suppressed: &[ErrorCause]) -> Vec<String> {
    suppressed
        .iter()
        .flat_map(|failure| {
            let root = failure.root();
            if root.suppressed.is_empty() {
                vec![root.describe()]
            } else {
                root_error_messages(&root.suppressed)
            }
        })
        .collect()
}

/// Structured description of a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingError {
    /// `None` for job-level failures that are not tied to one fetch step.
    pub process_step: Option<ProcessStep>,
    /// Kind of the error that ended the step.
    pub exception: String,
    pub error_detail: String,
    pub root_causes: Vec<String>,
    pub retry_counter: u32,
    pub last_attempt: DateTime<Utc>,
}

impl ProcessingError {
    pub fn new(error_detail: impl Into<String>) -> Self {
        Self {
            process_step: None,
            exception: "Error".to_string(),
            error_detail: error_detail.into(),
            root_causes: Vec::new(),
            retry_counter: 0,
            last_attempt: Utc::now(),
        }
    }

    /// Build from a cause tree; root causes come from its suppressed failures.
    pub fn from_cause(cause: &ErrorCause) -> Self {
        Self {
            exception: cause.kind.clone(),
            root_causes: root_error_messages(&cause.suppressed),
            ..Self::new(cause.message.clone())
        }
    }

    pub fn with_process_step(mut self, step: ProcessStep) -> Self {
        self.process_step = Some(step);
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = exception.into();
        self
    }

    pub fn with_root_causes(mut self, root_causes: Vec<String>) -> Self {
        self.root_causes = root_causes;
        self
    }

    /// Set the attempt count and stamp `last_attempt` with now.
    pub fn with_retry_counter_and_last_attempt_now(mut self, retry_counter: u32) -> Self {
        self.retry_counter = retry_counter;
        self.last_attempt = Utc::now();
        self
    }

    pub fn increment_retry(&mut self) {
        self.retry_counter += 1;
        self.last_attempt = Utc::now();
    }
}

/// Placeholder for an item that could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub item_id: String,
    pub business_partner_number: Option<String>,
    pub endpoint_url: Option<String>,
    pub processing_error: ProcessingError,
}

impl Tombstone {
    /// Tombstone for a failure described by a cause tree.
    pub fn from_cause(
        item_id: impl Into<String>,
        endpoint_url: Option<String>,
        cause: &ErrorCause,
        retry_count: u32,
        step: ProcessStep,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            business_partner_number: None,
            endpoint_url,
            processing_error: ProcessingError::from_cause(cause)
                .with_process_step(step)
                .with_retry_counter_and_last_attempt_now(retry_count),
        }
    }

    /// Tombstone for a failure that only has a message (e.g. a missing BPN).
    pub fn from_message(
        item_id: impl Into<String>,
        endpoint_url: Option<String>,
        message: impl Into<String>,
        retry_count: u32,
        step: ProcessStep,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            business_partner_number: None,
            endpoint_url,
            processing_error: ProcessingError::new(message)
                .with_process_step(step)
                .with_retry_counter_and_last_attempt_now(retry_count),
        }
    }

    pub fn with_business_partner_number(mut self, bpn: Option<String>) -> Self {
        self.business_partner_number = bpn;
        self
    }
}
