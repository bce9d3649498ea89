//! The discovery job and its state machine.
//!
//! A job moves forward only:
//!
//! ```text
//! UNSAVED -> INITIAL -> RUNNING -> TRANSFERS_FINISHED -> COMPLETED
//!                          \               \
//!                           +-> ERROR       +-> ERROR
//!   (any non-terminal) -> CANCELLED
//! ```
//!
//! `COMPLETED`, `ERROR` and `CANCELLED` are terminal. Once a job reaches one of
//! them, no further state change is accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::tombstone::ProcessingError;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Unsaved,
    Initial,
    Running,
    TransfersFinished,
    Completed,
    Error,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Unsaved,
        JobState::Initial,
        JobState::Running,
        JobState::TransfersFinished,
        JobState::Completed,
        JobState::Error,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error | JobState::Cancelled)
    }

    /// States in which a cancellation request still cancels work.
    ///
    /// `TRANSFERS_FINISHED` is excluded: the job is already assembling its
    /// result and timeout-driven cancellation leaves it alone.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobState::Unsaved | JobState::Initial | JobState::Running)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        match to {
            Unsaved => false,
            Initial => self == Unsaved,
            Running => self == Initial,
            TransfersFinished => self == Running,
            Completed => self == TransfersFinished,
            Error => matches!(self, Running | TransfersFinished),
            Cancelled => !self.is_terminal(),
        }
    }

    /// Position along the forward path; terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Unsaved => 0,
            JobState::Initial => 1,
            JobState::Running => 2,
            JobState::TransfersFinished => 3,
            JobState::Completed | JobState::Error | JobState::Cancelled => 4,
        }
    }
}

/// Which bill-of-material view to traverse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BomLifecycle {
    #[default]
    AsBuilt,
    AsPlanned,
    AsSpecified,
}

/// Traversal direction: towards components or towards the items that use them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Downward,
    Upward,
}

/// Identifies one item in the graph: its global asset id plus the business
/// partner number of the party that holds its data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub global_asset_id: String,
    pub bpn: Option<String>,
}

impl ItemKey {
    pub fn new(global_asset_id: impl Into<String>, bpn: impl Into<String>) -> Self {
        Self {
            global_asset_id: global_asset_id.into(),
            bpn: Some(bpn.into()),
        }
    }

    pub fn without_bpn(global_asset_id: impl Into<String>) -> Self {
        Self {
            global_asset_id: global_asset_id.into(),
            bpn: None,
        }
    }

    /// The BPN, if present and not blank.
    pub fn bpn(&self) -> Option<&str> {
        self.bpn.as_deref().filter(|b| !b.trim().is_empty())
    }
}

/// Caller-supplied parameters that shape a discovery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Maximum tree depth; the root sits at depth 0.
    pub depth: u32,
    /// Aspect types to collect when `collect_aspects` is set.
    pub aspects: Vec<String>,
    pub bom_lifecycle: BomLifecycle,
    pub direction: Direction,
    pub collect_aspects: bool,
    pub callback_url: Option<String>,
}

impl JobParameters {
    pub const DEFAULT_DEPTH: u32 = 1;

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_aspects(mut self, aspects: Vec<String>) -> Self {
        self.collect_aspects = !aspects.is_empty();
        self.aspects = aspects;
        self
    }

    pub fn with_bom_lifecycle(mut self, bom_lifecycle: BomLifecycle) -> Self {
        self.bom_lifecycle = bom_lifecycle;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            depth: Self::DEFAULT_DEPTH,
            aspects: Vec::new(),
            bom_lifecycle: BomLifecycle::default(),
            direction: Direction::default(),
            collect_aspects: false,
            callback_url: None,
        }
    }
}

/// A discovery job rooted at one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub key: ItemKey,
    pub parameters: JobParameters,
    pub state: JobState,
    pub owner: Option<String>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub last_modified_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    /// Populated only when the job ends in `ERROR`.
    pub error: Option<ProcessingError>,
}

impl Job {
    pub fn new(key: ItemKey, parameters: JobParameters, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            key,
            parameters,
            state: JobState::Unsaved,
            owner,
            created_on: now,
            started_on: None,
            last_modified_on: now,
            completed_on: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `to`, stamping the lifecycle timestamps.
    pub fn transition(&mut self, to: JobState) -> DomainResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::invalid_transition(self.state, to));
        }

        let now = Utc::now();
        self.state = to;
        self.last_modified_on = now;
        if to == JobState::Initial {
            self.started_on = Some(now);
        }
        if to.is_terminal() {
            self.completed_on = Some(now);
        }
        Ok(())
    }

    /// Move to `ERROR`, recording the summarizing error.
    pub fn fail(&mut self, error: ProcessingError) -> DomainResult<()> {
        self.transition(JobState::Error)?;
        self.error = Some(error);
        Ok(())
    }
}
