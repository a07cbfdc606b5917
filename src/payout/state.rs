//! Payout lifecycle states and the legal edges between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    IntentMarked,
    ReceiptConfirmed,
    Confirmed,
    VerificationFailed,
    Blocked,
    AutoReverted,
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAuthority {
    VerificationWorker,
    Reaper,
    Compliance,
}

impl TransitionAuthority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAuthority::VerificationWorker => "verification_worker",
            TransitionAuthority::Reaper => "reaper",
            TransitionAuthority::Compliance => "compliance",
        }
    }
}

impl std::fmt::Display for TransitionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a requested transition cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// Source is terminal. Recorded as an anomaly, stored status untouched.
    Terminal,
    /// Edge does not exist in the lifecycle graph.
    Illegal,
    /// Edge exists but the caller may not drive it.
    Unauthorized,
}

pub const STALE_CANDIDATES: [PayoutStatus; 2] =
    [PayoutStatus::IntentMarked, PayoutStatus::ReceiptConfirmed];

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::IntentMarked => "intent_marked",
            PayoutStatus::ReceiptConfirmed => "receipt_confirmed",
            PayoutStatus::Confirmed => "confirmed",
            PayoutStatus::VerificationFailed => "verification_failed",
            PayoutStatus::Blocked => "blocked",
            PayoutStatus::AutoReverted => "auto_reverted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "intent_marked" => Some(PayoutStatus::IntentMarked),
            "receipt_confirmed" => Some(PayoutStatus::ReceiptConfirmed),
            "confirmed" => Some(PayoutStatus::Confirmed),
            "verification_failed" => Some(PayoutStatus::VerificationFailed),
            "blocked" => Some(PayoutStatus::Blocked),
            "auto_reverted" => Some(PayoutStatus::AutoReverted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Confirmed | PayoutStatus::AutoReverted | PayoutStatus::Blocked
        )
    }

    /// The only caller allowed to move a payout into `self`.
    pub fn required_authority(&self) -> Option<TransitionAuthority> {
        match self {
            PayoutStatus::IntentMarked => None,
            PayoutStatus::ReceiptConfirmed
            | PayoutStatus::Confirmed
            | PayoutStatus::VerificationFailed => Some(TransitionAuthority::VerificationWorker),
            PayoutStatus::AutoReverted => Some(TransitionAuthority::Reaper),
            PayoutStatus::Blocked => Some(TransitionAuthority::Compliance),
        }
    }

    pub fn can_transition_to(&self, next: &PayoutStatus) -> bool {
        use PayoutStatus::*;
        match (self, next) {
            (IntentMarked, ReceiptConfirmed) => true,
            (ReceiptConfirmed, Confirmed) => true,
            (IntentMarked | ReceiptConfirmed, VerificationFailed) => true,
            (IntentMarked | ReceiptConfirmed, Blocked) => true,
            (IntentMarked | ReceiptConfirmed, AutoReverted) => true,
            _ => false,
        }
    }

    /// Full check for `authority` driving `self -> next`.
    pub fn check_transition(
        &self,
        next: PayoutStatus,
        authority: TransitionAuthority,
    ) -> Result<(), TransitionRejection> {
        if self.is_terminal() {
            return Err(TransitionRejection::Terminal);
        }
        if !self.can_transition_to(&next) {
            return Err(TransitionRejection::Illegal);
        }
        if next.required_authority() != Some(authority) {
            return Err(TransitionRejection::Unauthorized);
        }
        Ok(())
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payout per order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payout {
    pub id: Uuid,
    pub order_id: String,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    pub fn intent(order_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            status: PayoutStatus::IntentMarked,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PayoutStatus::*;

    const ALL: [PayoutStatus; 6] = [
        IntentMarked,
        ReceiptConfirmed,
        Confirmed,
        VerificationFailed,
        Blocked,
        AutoReverted,
    ];

    #[test]
    fn test_happy_path_edges() {
        assert!(IntentMarked.can_transition_to(&ReceiptConfirmed));
        assert!(ReceiptConfirmed.can_transition_to(&Confirmed));
        assert!(!IntentMarked.can_transition_to(&Confirmed));
    }

    #[test]
    fn test_terminal_states_never_leave() {
        for from in [Confirmed, AutoReverted, Blocked] {
            for to in ALL {
                assert!(!from.can_transition_to(&to), "{from} -> {to}");
                assert_eq!(
                    from.check_transition(to, TransitionAuthority::VerificationWorker),
                    Err(TransitionRejection::Terminal)
                );
            }
        }
    }

    #[test]
    fn test_no_backward_edges() {
        assert!(!ReceiptConfirmed.can_transition_to(&IntentMarked));
        for to in ALL {
            assert!(!VerificationFailed.can_transition_to(&to));
        }
    }

    #[test]
    fn test_authority_is_enforced() {
        assert_eq!(
            ReceiptConfirmed.check_transition(AutoReverted, TransitionAuthority::VerificationWorker),
            Err(TransitionRejection::Unauthorized)
        );
        assert_eq!(
            ReceiptConfirmed.check_transition(Confirmed, TransitionAuthority::Reaper),
            Err(TransitionRejection::Unauthorized)
        );
        assert_eq!(
            IntentMarked.check_transition(Blocked, TransitionAuthority::Compliance),
            Ok(())
        );
        assert_eq!(
            ReceiptConfirmed.check_transition(AutoReverted, TransitionAuthority::Reaper),
            Ok(())
        );
    }

    #[test]
    fn test_status_text_round_trips() {
        for status in ALL {
            assert_eq!(PayoutStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PayoutStatus::parse("CONFIRMED"), None);
    }
}
