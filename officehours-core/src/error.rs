// ABOUTME: Usage errors returned by queue and help-session operations.
// ABOUTME: Callers could have checked these preconditions; they are surfaced verbatim.

use crate::ids::{MemberId, QueueId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{member} is already in queue {queue}")]
    AlreadyInQueue { member: MemberId, queue: QueueId },

    #[error("{member} is already waiting in queue {other}")]
    AlreadyInAnotherQueue { member: MemberId, other: QueueId },

    #[error("queue {queue} is empty")]
    QueueEmpty { queue: QueueId },

    #[error("{member} is not in queue {queue}")]
    NotInQueue { member: MemberId, queue: QueueId },

    #[error("{member} is already helping")]
    AlreadyHelping { member: MemberId },

    #[error("{member} is not helping")]
    NotHelping { member: MemberId },

    #[error("queue {queue} does not exist")]
    QueueNotFound { queue: QueueId },

    #[error("queue {queue} already exists")]
    QueueAlreadyExists { queue: QueueId },
}

impl QueueError {
    /// Short stable name for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyInQueue { .. } => "already_in_queue",
            Self::AlreadyInAnotherQueue { .. } => "already_in_another_queue",
            Self::QueueEmpty { .. } => "queue_empty",
            Self::NotInQueue { .. } => "not_in_queue",
            Self::AlreadyHelping { .. } => "already_helping",
            Self::NotHelping { .. } => "not_helping",
            Self::QueueNotFound { .. } => "queue_not_found",
            Self::QueueAlreadyExists { .. } => "queue_already_exists",
        }
    }
}
