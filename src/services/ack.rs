//! Acknowledgement decisions for inbound deliveries

use crate::services::writer::WriteOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged so the broker redelivers after `ack_wait`
    Withhold,
}

impl Disposition {
    pub fn for_write(outcome: &WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Inserted(_) | WriteOutcome::Duplicate => Disposition::Ack,
            WriteOutcome::Failed { .. } => Disposition::Withhold,
        }
    }
}
