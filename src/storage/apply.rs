use crate::error::PersistenceError;
use crate::messaging::ResultMessage;
use crate::storage::model::TaskStatus;

/// What applying a result message would do to a task in `current` status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move the task to this status
    Apply(TaskStatus),
    /// The message's effect has already landed
    Duplicate,
}

/// Outcome of applying a result message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Duplicate,
}

/// Status rules for result messages. A terminal status never regresses:
/// progress after a terminal outcome, or a conflicting terminal outcome, is
/// reported as an ordering violation and nothing is written.
pub fn plan_transition(current: TaskStatus, message: &ResultMessage) -> Result<Transition, PersistenceError> {
    let target = match message {
        ResultMessage::Processing { .. } => TaskStatus::Processing,
        ResultMessage::Completed { .. } => TaskStatus::Completed,
        ResultMessage::Failed { .. } => TaskStatus::Failed,
    };

    if !current.is_terminal() {
        return Ok(Transition::Apply(target));
    }

    if current == target {
        return Ok(Transition::Duplicate);
    }

    Err(PersistenceError::OrderingViolation {
        task_id: message.task_id(),
        status: current,
        message: message.kind(),
    })
}

/// Ledger label for a results batch; the implicit label is stored as ""
pub fn batch_label(label: &Option<String>) -> &str {
    label.as_deref().unwrap_or("")
}
