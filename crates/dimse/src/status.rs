//! DIMSE status codes and per-service response evaluation

use tracing::warn;

use crate::command::{CommandField, CommandMessage, SubOperations};

pub const SUCCESS: u16 = 0x0000;
pub const PENDING: u16 = 0xFF00;
/// Pending, with one or more optional keys not supported
pub const PENDING_WARNING: u16 = 0xFF01;
pub const CANCEL: u16 = 0xFE00;

pub const WARNING_COERCION_OF_DATA_ELEMENTS: u16 = 0xB000;
pub const WARNING_SUB_OPERATIONS_FAILED: u16 = 0xB000;
pub const WARNING_ELEMENTS_DISCARDED: u16 = 0xB006;
pub const WARNING_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xB007;

pub const OUT_OF_RESOURCES: u16 = 0xA700;
pub const OUT_OF_RESOURCES_UNABLE_TO_CALCULATE_MATCHES: u16 = 0xA701;
pub const OUT_OF_RESOURCES_UNABLE_TO_PERFORM_SUB_OPERATIONS: u16 = 0xA702;
pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
pub const UNABLE_TO_PROCESS: u16 = 0xC000;
pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

/// Consecutive non-decreasing pending responses tolerated from a C-MOVE or
/// C-GET peer before the exchange is forced to end
pub const STALL_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

pub fn classify(status: u16) -> StatusKind {
    match status {
        SUCCESS => StatusKind::Success,
        PENDING | PENDING_WARNING => StatusKind::Pending,
        CANCEL => StatusKind::Cancel,
        0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusKind::Warning,
        _ => StatusKind::Failure,
    }
}

pub fn is_pending(status: u16) -> bool {
    classify(status) == StatusKind::Pending
}

/// C-STORE counts success and the coercion/discard warnings as stored
pub fn is_store_success(status: u16) -> bool {
    matches!(
        status,
        SUCCESS | WARNING_COERCION_OF_DATA_ELEMENTS | WARNING_ELEMENTS_DISCARDED | WARNING_DATA_SET_DOES_NOT_MATCH_SOP_CLASS
    )
}

/// Tracks the `remaining` counter across pending C-MOVE/C-GET responses.
#[derive(Debug, Clone)]
pub struct StallDetector {
    last_remaining: Option<u16>,
    stalls: u32,
    limit: u32,
}

impl Default for StallDetector {
    fn default() -> Self {
        Self::new(STALL_LIMIT)
    }
}

impl StallDetector {
    pub fn new(limit: u32) -> Self {
        Self { last_remaining: None, stalls: 0, limit }
    }

    /// Records one pending response; returns true once the peer has sent
    /// `limit` consecutive responses whose remaining count did not drop.
    ///
    /// The first pending response is the baseline and is not compared with
    /// anything, so with the default limit of 100 the exchange ends on the
    /// 101st pending response: 100 responses that each failed to lower
    /// `remaining` relative to the one before. A missing remaining count
    /// never counts as progress.
    pub fn observe(&mut self, remaining: Option<u16>, seen_before: bool) -> bool {
        let decreased = match (self.last_remaining, remaining) {
            (Some(previous), Some(current)) => current < previous,
            _ => false,
        };
        if seen_before {
            if decreased {
                self.stalls = 0;
            } else {
                self.stalls += 1;
            }
        }
        if remaining.is_some() {
            self.last_remaining = remaining;
        }
        self.stalls >= self.limit
    }

    pub fn stalls(&self) -> u32 {
        self.stalls
    }
}

/// The composite services whose responses can be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Echo,
    Store,
    Find,
    Move,
    Get,
}

impl ServiceKind {
    pub fn response_field(self) -> CommandField {
        match self {
            ServiceKind::Echo => CommandField::CEchoRsp,
            ServiceKind::Store => CommandField::CStoreRsp,
            ServiceKind::Find => CommandField::CFindRsp,
            ServiceKind::Move => CommandField::CMoveRsp,
            ServiceKind::Get => CommandField::CGetRsp,
        }
    }
}

/// What a single response means for the exchange it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// More responses follow
    Pending,
    /// Terminal response
    Final { success: bool },
    /// The peer kept answering pending without progress
    Stalled,
}

/// Per-exchange status state machine.
#[derive(Debug, Clone)]
pub struct StatusEvaluator {
    kind: ServiceKind,
    stall: StallDetector,
    pending_responses: usize,
    last_status: Option<u16>,
    counts: SubOperations,
}

impl StatusEvaluator {
    pub fn new(kind: ServiceKind) -> Self {
        Self::with_stall_limit(kind, STALL_LIMIT)
    }

    pub fn with_stall_limit(kind: ServiceKind, limit: u32) -> Self {
        Self {
            kind,
            stall: StallDetector::new(limit),
            pending_responses: 0,
            last_status: None,
            counts: SubOperations::default(),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn evaluate(&mut self, response: &CommandMessage) -> Evaluation {
        let status = response.status.unwrap_or(UNABLE_TO_PROCESS);
        self.last_status = Some(status);
        if let Some(counts) = response.sub_operations {
            self.counts = counts;
        }

        match self.kind {
            ServiceKind::Echo => Evaluation::Final { success: status == SUCCESS },
            ServiceKind::Store => Evaluation::Final { success: is_store_success(status) },
            ServiceKind::Find if is_pending(status) => {
                self.pending_responses += 1;
                Evaluation::Pending
            }
            ServiceKind::Move | ServiceKind::Get if is_pending(status) => {
                let seen_before = self.pending_responses > 0;
                self.pending_responses += 1;
                let remaining = response.sub_operations.and_then(|c| c.remaining);
                if self.stall.observe(remaining, seen_before) {
                    warn!(
                        stalls = self.stall.stalls(),
                        remaining = ?remaining,
                        "peer keeps answering pending without progress, giving up"
                    );
                    Evaluation::Stalled
                } else {
                    Evaluation::Pending
                }
            }
            ServiceKind::Find | ServiceKind::Move | ServiceKind::Get => Evaluation::Final { success: status == SUCCESS },
        }
    }

    pub fn pending_responses(&self) -> usize {
        self.pending_responses
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    pub fn counts(&self) -> SubOperations {
        self.counts
    }
}

/// Result of a C-ECHO exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoOutcome {
    pub status: u16,
    pub success: bool,
    pub error_comment: Option<String>,
}

/// Result of a C-STORE exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub sop_instance_uid: String,
    pub status: u16,
    pub success: bool,
    pub error_comment: Option<String>,
}

/// Result of a C-FIND exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindOutcome {
    pub status: u16,
    pub success: bool,
    /// Identifiers delivered to the caller
    pub matches: usize,
    pub error_comment: Option<String>,
}

/// Result of a C-MOVE or C-GET exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveOutcome {
    pub status: u16,
    pub success: bool,
    pub counts: SubOperations,
    pub pending_responses: usize,
    /// Ended by stall detection rather than a final response
    pub stalled: bool,
    pub error_comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Priority;
    use crate::uids;

    fn move_pending(remaining: u16) -> CommandMessage {
        CommandMessage::move_rq(1, uids::STUDY_ROOT_QR_MOVE, "DEST", Priority::Medium)
            .response(PENDING)
            .unwrap()
            .with_sub_operations(SubOperations { remaining: Some(remaining), ..Default::default() })
    }

    #[test]
    fn test_store_success_mapping() {
        for status in 0..=u16::MAX {
            let expected = matches!(status, 0x0000 | 0xB000 | 0xB006 | 0xB007);
            assert_eq!(is_store_success(status), expected, "status {:#06x}", status);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(0x0000), StatusKind::Success);
        assert_eq!(classify(0xFF01), StatusKind::Pending);
        assert_eq!(classify(0xFE00), StatusKind::Cancel);
        assert_eq!(classify(0xB007), StatusKind::Warning);
        assert_eq!(classify(0xA801), StatusKind::Failure);
        assert_eq!(classify(0xC123), StatusKind::Failure);
    }

    #[test]
    fn test_stall_after_exactly_limit() {
        let mut evaluator = StatusEvaluator::new(ServiceKind::Move);
        // The first pending response only sets the baseline
        assert_eq!(evaluator.evaluate(&move_pending(5)), Evaluation::Pending);
        for _ in 0..(STALL_LIMIT - 1) {
            assert_eq!(evaluator.evaluate(&move_pending(5)), Evaluation::Pending);
        }
        assert_eq!(evaluator.evaluate(&move_pending(5)), Evaluation::Stalled);
        assert_eq!(evaluator.pending_responses(), STALL_LIMIT as usize + 1);
    }

    #[test]
    fn test_progress_resets_stall_counter() {
        let mut evaluator = StatusEvaluator::with_stall_limit(ServiceKind::Get, 3);
        evaluator.evaluate(&move_pending(10));
        evaluator.evaluate(&move_pending(10));
        evaluator.evaluate(&move_pending(10));
        assert_eq!(evaluator.evaluate(&move_pending(9)), Evaluation::Pending);
        evaluator.evaluate(&move_pending(9));
        evaluator.evaluate(&move_pending(9));
        assert_eq!(evaluator.evaluate(&move_pending(9)), Evaluation::Stalled);
    }

    #[test]
    fn test_find_final_requires_exact_success() {
        let rq = CommandMessage::find_rq(1, uids::STUDY_ROOT_QR_FIND, Priority::Medium);
        let mut evaluator = StatusEvaluator::new(ServiceKind::Find);
        assert_eq!(evaluator.evaluate(&rq.response(PENDING_WARNING).unwrap()), Evaluation::Pending);
        assert_eq!(evaluator.evaluate(&rq.response(CANCEL).unwrap()), Evaluation::Final { success: false });

        let mut evaluator = StatusEvaluator::new(ServiceKind::Find);
        assert_eq!(evaluator.evaluate(&rq.response(SUCCESS).unwrap()), Evaluation::Final { success: true });
    }
}
