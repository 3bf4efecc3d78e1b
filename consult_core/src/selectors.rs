//! Read-only views derived from a state snapshot.

use crate::consultation::{ArchivedConsultation, Consultation, SessionSummary};
use crate::store::AppState;
use crate::types::{MedicalError, Notification, Severity};
use chrono::{DateTime, Duration, Utc};

pub fn current_consultation(state: &AppState) -> Option<&Consultation> {
    state.consultation.current()
}

/// Active consultations, most recently active first
pub fn active_consultations(state: &AppState) -> Vec<&Consultation> {
    let mut list: Vec<&Consultation> = state.consultation.active.values().map(|c| c.as_ref()).collect();
    list.sort_by(|a, b| b.metadata.last_activity.cmp(&a.metadata.last_activity));
    list
}

/// Archived consultations, most recently archived first
pub fn archived_consultations(state: &AppState) -> Vec<&ArchivedConsultation> {
    let mut list: Vec<&ArchivedConsultation> =
        state.consultation.archived.values().map(|c| c.as_ref()).collect();
    list.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
    list
}

pub fn is_recording(state: &AppState) -> bool {
    current_consultation(state).is_some_and(|c| c.transcription.is_recording)
}

pub fn unread_notifications(state: &AppState) -> Vec<&Notification> {
    state.system.unread_notifications().collect()
}

pub fn unread_count(state: &AppState) -> usize {
    state.system.unread_notifications().count()
}

pub fn critical_errors(state: &AppState) -> Vec<&MedicalError> {
    state
        .system
        .errors
        .iter()
        .filter(|e| e.severity == Severity::Critical)
        .collect()
}

/// Errors raised within `window` of `now`, newest first
pub fn recent_errors(state: &AppState, now: DateTime<Utc>, window: Duration) -> Vec<&MedicalError> {
    let cutoff = now - window;
    state
        .system
        .errors
        .iter()
        .rev()
        .filter(|e| e.timestamp >= cutoff)
        .collect()
}

pub fn memory_threshold_mb(state: &AppState) -> f64 {
    state.system.memory_threshold_mb()
}

/// Recorded time of the current consultation, including a running stretch
pub fn recording_duration(state: &AppState, now: DateTime<Utc>) -> Duration {
    current_consultation(state)
        .map(|c| c.recording_duration(now))
        .unwrap_or_else(Duration::zero)
}

pub fn session_summary(state: &AppState, now: DateTime<Utc>) -> Option<SessionSummary> {
    current_consultation(state).map(|c| c.summary(now))
}

pub fn transcript_word_count(state: &AppState) -> usize {
    current_consultation(state)
        .map(|c| c.transcription.final_transcript.split_whitespace().count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ReduceContext;
    use crate::clock::SequentialIds;
    use crate::consultation::{self, ConsultationAction, EndReason, SegmentDraft};
    use crate::system::{self, SystemAction};
    use crate::types::ErrorCode;

    struct Harness {
        state: AppState,
        ids: SequentialIds,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                state: AppState::default(),
                ids: SequentialIds::default(),
                now: Utc::now(),
            }
        }

        fn consult(&mut self, action: ConsultationAction) {
            let ctx = ReduceContext::new(self.now, &self.ids);
            consultation::reduce(&mut self.state.consultation, &action, &ctx);
        }

        fn system(&mut self, action: SystemAction) {
            let ctx = ReduceContext::new(self.now, &self.ids);
            system::reduce(&mut self.state.system, &action, &ctx);
        }

        fn start(&mut self, id: &str) {
            self.consult(ConsultationAction::Start {
                id: id.into(),
                patient: None,
                ai_mode: None,
            });
        }
    }

    #[test]
    fn test_empty_state_views() {
        let state = AppState::default();
        assert!(current_consultation(&state).is_none());
        assert!(!is_recording(&state));
        assert_eq!(transcript_word_count(&state), 0);
        assert_eq!(recording_duration(&state, Utc::now()), Duration::zero());
        assert_eq!(memory_threshold_mb(&state), 200.0);
    }

    #[test]
    fn test_recording_views_follow_current() {
        let mut h = Harness::new();
        h.start("c1");
        h.consult(ConsultationAction::StartRecording { id: "c1".into() });
        h.consult(ConsultationAction::FinalizeTranscript {
            id: "c1".into(),
            segment: SegmentDraft::text("patient reports  mild headache"),
        });

        assert!(is_recording(&h.state));
        assert_eq!(transcript_word_count(&h.state), 4);
        let later = h.now + Duration::seconds(30);
        assert_eq!(recording_duration(&h.state, later), Duration::seconds(30));
        assert_eq!(
            session_summary(&h.state, later).unwrap().transcript,
            "patient reports  mild headache"
        );
    }

    #[test]
    fn test_lists_are_ordered_newest_first() {
        let mut h = Harness::new();
        h.start("c1");
        h.now += Duration::seconds(1);
        h.start("c2");
        h.now += Duration::seconds(1);
        h.consult(ConsultationAction::End {
            id: "c1".into(),
            reason: EndReason::Completed,
        });
        h.now += Duration::seconds(1);
        h.start("c3");
        h.now += Duration::seconds(1);
        h.consult(ConsultationAction::End {
            id: "c3".into(),
            reason: EndReason::Cancelled,
        });

        let active: Vec<_> = active_consultations(&h.state).iter().map(|c| c.id.as_str()).collect();
        assert_eq!(active, vec!["c2"]);
        let archived: Vec<_> = archived_consultations(&h.state).iter().map(|c| c.id.as_str()).collect();
        assert_eq!(archived, vec!["c3", "c1"]);
    }

    #[test]
    fn test_error_views() {
        let mut h = Harness::new();
        let old = MedicalError::new("e1", ErrorCode::StorageError, Severity::Critical, "disk full", h.now);
        h.system(SystemAction::AddError { error: old });
        h.now += Duration::minutes(30);
        let fresh = MedicalError::new("e2", ErrorCode::AiError, Severity::Low, "slow model", h.now);
        h.system(SystemAction::AddError { error: fresh });

        assert_eq!(critical_errors(&h.state).len(), 1);
        let recent: Vec<_> = recent_errors(&h.state, h.now, Duration::minutes(10))
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(recent, vec!["e2"]);
        // Critical errors raise a notification
        assert_eq!(unread_count(&h.state), 1);
        assert_eq!(unread_notifications(&h.state)[0].title, "Storage problem");
    }
}
