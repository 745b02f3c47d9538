//! Mutation events published from the request path.
//!
//! A single tagged record covers every counter mutation; handler chains
//! dispatch on [`MutationKind`] with `match`.

use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;
use super::types::{CounterName, TargetRef, UserId};

/// Kind of mutation carried by a [`MutationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Like,
    Unlike,
    CommentDelta,
    View,
}

impl MutationKind {
    /// The counter this kind of mutation moves.
    pub fn counter(self) -> CounterName {
        match self {
            Self::Like | Self::Unlike => CounterName::Likes,
            Self::CommentDelta => CounterName::Comments,
            Self::View => CounterName::Views,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Unlike => "unlike",
            Self::CommentDelta => "comment_delta",
            Self::View => "view",
        }
    }
}

/// An immutable counter mutation, consumed exactly once by its handler chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    /// Unique identifier for log correlation (UUIDv4).
    pub id: Uuid,
    /// Publish order within this process; assigned by the pipeline.
    pub sequence: u64,
    pub target: TargetRef,
    pub kind: MutationKind,
    pub delta: i64,
    pub actor_id: UserId,
    pub occurred_at: OffsetDateTime,
}

impl MutationEvent {
    fn new(kind: MutationKind, target: TargetRef, actor_id: UserId, delta: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            target,
            kind,
            delta,
            actor_id,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn like(actor_id: UserId, target: TargetRef) -> Self {
        Self::new(MutationKind::Like, target, actor_id, 1)
    }

    pub fn unlike(actor_id: UserId, target: TargetRef) -> Self {
        Self::new(MutationKind::Unlike, target, actor_id, -1)
    }

    pub fn view(actor_id: UserId, target: TargetRef) -> Self {
        Self::new(MutationKind::View, target, actor_id, 1)
    }

    /// A comment was added (`delta > 0`) or removed (`delta < 0`) on `target`.
    pub fn comment_delta(
        actor_id: UserId,
        target: TargetRef,
        delta: i64,
    ) -> Result<Self, DomainError> {
        if delta == 0 {
            return Err(DomainError::validation("comment delta must be non-zero"));
        }
        Ok(Self::new(MutationKind::CommentDelta, target, actor_id, delta))
    }

    pub fn counter(&self) -> CounterName {
        self.kind.counter()
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}
