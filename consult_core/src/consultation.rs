//! Consultation slice: the encounter state machine.
//!
//! A consultation moves `active ⇄ paused` while in the active map and ends
//! as `completed` or `archived` once moved into the archive map. Archived
//! snapshots are never touched again; any action addressed to an id that is
//! not in the active map is a silent no-op.

use crate::action::ReduceContext;
use crate::types::{push_bounded, AiMode};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Finalized transcript segments kept per consultation
pub const SEGMENT_CAP: usize = 100;
/// AI messages kept per consultation
pub const MESSAGE_CAP: usize = 50;
/// SOAP edits kept per consultation
pub const EDIT_HISTORY_CAP: usize = 20;
/// Recently started consultation ids
pub const HISTORY_CAP: usize = 10;
/// Minimum spacing between applied audio-level updates
pub const AUDIO_LEVEL_THROTTLE_MS: i64 = 100;

// ============================================================================
// Consultation Model
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

/// Why a consultation left the active map
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Cancelled,
    Expired,
    Archived,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PatientInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Session {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Accumulated recording time, excluding pauses
    pub duration_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub id: String,
    pub text: String,
    pub speaker: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Final hypothesis as emitted by the transcription engine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SegmentDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub start_ms: Option<u64>,
    #[serde(default)]
    pub end_ms: Option<u64>,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl SegmentDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 1.0,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TranscriptionState {
    pub is_recording: bool,
    pub is_paused: bool,
    pub live_transcript: String,
    pub final_transcript: String,
    pub confidence: f32,
    pub audio_level: f32,
    pub segments: VecDeque<TranscriptSegment>,
    /// Start of the currently running recording stretch
    pub recording_started_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiRole {
    Assistant,
    User,
    System,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiMessageKind {
    Suggestion,
    Question,
    Insight,
    Warning,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AiMessage {
    pub id: String,
    pub role: AiRole,
    pub kind: AiMessageKind,
    pub content: String,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AiMessageDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub role: AiRole,
    pub kind: AiMessageKind,
    pub content: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AiMessageDraft {
    pub fn suggestion(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: AiRole::Assistant,
            kind: AiMessageKind::Suggestion,
            content: content.into(),
            confidence: None,
            timestamp: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    DrugInteraction,
    Allergy,
    VitalSign,
    Diagnostic,
    Guideline,
    Other,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClinicalAlert {
    pub id: String,
    pub title: String,
    pub message: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub dismissed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlertDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub message: String,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct AiState {
    pub is_thinking: bool,
    pub mode: AiMode,
    pub messages: VecDeque<AiMessage>,
    pub clinical_alerts: Vec<ClinicalAlert>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SoapSection {
    Subjective,
    Objective,
    Assessment,
    Plan,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SoapNote {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
}

impl SoapNote {
    pub fn section(&self, section: SoapSection) -> &str {
        match section {
            SoapSection::Subjective => &self.subjective,
            SoapSection::Objective => &self.objective,
            SoapSection::Assessment => &self.assessment,
            SoapSection::Plan => &self.plan,
        }
    }

    fn section_mut(&mut self, section: SoapSection) -> &mut String {
        match section {
            SoapSection::Subjective => &mut self.subjective,
            SoapSection::Objective => &mut self.objective,
            SoapSection::Assessment => &mut self.assessment,
            SoapSection::Plan => &mut self.plan,
        }
    }

    fn merge(&mut self, patch: &SoapPatch) {
        if let Some(ref s) = patch.subjective {
            self.subjective = s.clone();
        }
        if let Some(ref s) = patch.objective {
            self.objective = s.clone();
        }
        if let Some(ref s) = patch.assessment {
            self.assessment = s.clone();
        }
        if let Some(ref s) = patch.plan {
            self.plan = s.clone();
        }
    }
}

/// Partial SOAP output from the generator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SoapPatch {
    pub subjective: Option<String>,
    pub objective: Option<String>,
    pub assessment: Option<String>,
    pub plan: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SoapEdit {
    pub section: SoapSection,
    pub previous_value: String,
    pub new_value: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Documentation {
    pub soap: SoapNote,
    pub is_generating: bool,
    pub generation_progress: f32,
    pub last_saved: Option<DateTime<Utc>>,
    pub edit_history: VecDeque<SoapEdit>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SymptomSeverity {
    Mild,
    Moderate,
    Severe,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Symptom {
    pub name: String,
    pub severity: Option<SymptomSeverity>,
    pub duration: Option<String>,
    pub notes: Option<String>,
}

impl Symptom {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            severity: None,
            duration: None,
            notes: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub name: String,
    pub icd10_code: Option<String>,
    /// Likelihood in [0, 1]
    pub probability: f32,
    pub reasoning: Option<String>,
    pub confirmed: bool,
}

impl Diagnosis {
    pub fn new(name: impl Into<String>, probability: f32) -> Self {
        Self {
            name: name.into(),
            icd10_code: None,
            probability,
            reasoning: None,
            confirmed: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct VitalSigns {
    pub systolic_bp: Option<u16>,
    pub diastolic_bp: Option<u16>,
    pub heart_rate: Option<u16>,
    pub respiratory_rate: Option<u16>,
    pub temperature_c: Option<f32>,
    pub oxygen_saturation: Option<f32>,
    pub weight_kg: Option<f32>,
    pub height_cm: Option<f32>,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct VitalSignsPatch {
    pub systolic_bp: Option<u16>,
    pub diastolic_bp: Option<u16>,
    pub heart_rate: Option<u16>,
    pub respiratory_rate: Option<u16>,
    pub temperature_c: Option<f32>,
    pub oxygen_saturation: Option<f32>,
    pub weight_kg: Option<f32>,
    pub height_cm: Option<f32>,
}

impl VitalSigns {
    fn merge(&mut self, patch: &VitalSignsPatch) {
        self.systolic_bp = patch.systolic_bp.or(self.systolic_bp);
        self.diastolic_bp = patch.diastolic_bp.or(self.diastolic_bp);
        self.heart_rate = patch.heart_rate.or(self.heart_rate);
        self.respiratory_rate = patch.respiratory_rate.or(self.respiratory_rate);
        self.temperature_c = patch.temperature_c.or(self.temperature_c);
        self.oxygen_saturation = patch.oxygen_saturation.or(self.oxygen_saturation);
        self.weight_kg = patch.weight_kg.or(self.weight_kg);
        self.height_cm = patch.height_cm.or(self.height_cm);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub name: String,
    pub dosage: Option<String>,
    pub frequency: Option<String>,
    pub duration: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TreatmentPlan {
    pub medications: Vec<Medication>,
    pub procedures: Vec<String>,
    pub referrals: Vec<String>,
    pub patient_education: Vec<String>,
    pub follow_up: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TreatmentPlanPatch {
    pub medications: Option<Vec<Medication>>,
    pub procedures: Option<Vec<String>>,
    pub referrals: Option<Vec<String>>,
    pub patient_education: Option<Vec<String>>,
    pub follow_up: Option<String>,
}

impl TreatmentPlan {
    fn merge(&mut self, patch: &TreatmentPlanPatch) {
        if let Some(ref v) = patch.medications {
            self.medications = v.clone();
        }
        if let Some(ref v) = patch.procedures {
            self.procedures = v.clone();
        }
        if let Some(ref v) = patch.referrals {
            self.referrals = v.clone();
        }
        if let Some(ref v) = patch.patient_education {
            self.patient_education = v.clone();
        }
        if patch.follow_up.is_some() {
            self.follow_up = patch.follow_up.clone();
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsultationMetadata {
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub version: u64,
}

/// One in-progress medical encounter
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Consultation {
    pub id: String,
    pub status: ConsultationStatus,
    pub patient: Option<PatientInfo>,
    pub session: Session,
    pub transcription: TranscriptionState,
    pub ai: AiState,
    pub documentation: Documentation,
    pub symptoms: Vec<Symptom>,
    pub vital_signs: VitalSigns,
    pub diagnoses: Vec<Diagnosis>,
    pub treatment_plan: TreatmentPlan,
    pub metadata: ConsultationMetadata,
}

impl Consultation {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: ConsultationStatus::Active,
            patient: None,
            session: Session::default(),
            transcription: TranscriptionState::default(),
            ai: AiState::default(),
            documentation: Documentation::default(),
            symptoms: Vec::new(),
            vital_signs: VitalSigns::default(),
            diagnoses: Vec::new(),
            treatment_plan: TreatmentPlan::default(),
            metadata: ConsultationMetadata {
                created_at: now,
                last_activity: now,
                version: 0,
            },
        }
    }

    /// Recorded time including the stretch currently running
    pub fn recording_duration(&self, now: DateTime<Utc>) -> Duration {
        let running = self
            .transcription
            .recording_started_at
            .map(|started| (now - started).max(Duration::zero()))
            .unwrap_or_else(Duration::zero);
        Duration::milliseconds(self.session.duration_ms) + running
    }

    /// Read-optimized view over the encounter
    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            start_time: self.session.start_time,
            end_time: self.session.end_time,
            duration_ms: self.recording_duration(now).num_milliseconds(),
            transcript: self.transcription.final_transcript.clone(),
            ai_suggestions: self
                .ai
                .messages
                .iter()
                .filter(|m| m.kind == AiMessageKind::Suggestion)
                .map(|m| m.content.clone())
                .collect(),
            clinical_alerts: self.ai.clinical_alerts.clone(),
            vital_signs: self.vital_signs.clone(),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.last_activity = now;
        self.metadata.version += 1;
    }

    /// Fold the running recording stretch into the session duration
    fn settle_recording(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.transcription.recording_started_at.take() {
            let elapsed = (now - started).num_milliseconds().max(0);
            self.session.duration_ms += elapsed;
        }
    }
}

/// Session fields captured at archive time
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub transcript: String,
    pub ai_suggestions: Vec<String>,
    pub clinical_alerts: Vec<ClinicalAlert>,
    pub vital_signs: VitalSigns,
}

/// Immutable snapshot of an ended consultation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArchivedConsultation {
    pub id: String,
    pub status: ConsultationStatus,
    pub reason: EndReason,
    pub patient: Option<PatientInfo>,
    pub session: SessionSummary,
    pub documentation: Documentation,
    pub symptoms: Vec<Symptom>,
    pub diagnoses: Vec<Diagnosis>,
    pub treatment_plan: TreatmentPlan,
    pub metadata: ConsultationMetadata,
    pub archived_at: DateTime<Utc>,
}

/// The consultation slice of the application state
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ConsultationState {
    pub active: BTreeMap<String, Arc<Consultation>>,
    pub archived: BTreeMap<String, Arc<ArchivedConsultation>>,
    pub current_id: Option<String>,
    pub history: VecDeque<String>,
}

impl ConsultationState {
    pub fn get(&self, id: &str) -> Option<&Consultation> {
        self.active.get(id).map(Arc::as_ref)
    }

    pub fn current(&self) -> Option<&Consultation> {
        self.current_id.as_deref().and_then(|id| self.get(id))
    }

    /// Whether `id` is taken by an active or archived consultation
    pub fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.archived.contains_key(id)
    }
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ConsultationAction {
    Start {
        id: String,
        #[serde(default)]
        patient: Option<PatientInfo>,
        #[serde(default)]
        ai_mode: Option<AiMode>,
    },
    End {
        id: String,
        reason: EndReason,
    },
    SetCurrent {
        id: Option<String>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    StartRecording {
        id: String,
    },
    StopRecording {
        id: String,
    },
    UpdateLiveTranscript {
        id: String,
        text: String,
        confidence: f32,
    },
    FinalizeTranscript {
        id: String,
        segment: SegmentDraft,
    },
    UpdateAudioLevel {
        id: String,
        level: f32,
    },
    SetThinking {
        id: String,
        thinking: bool,
    },
    SetAiMode {
        id: String,
        mode: AiMode,
    },
    AddAiMessage {
        id: String,
        message: AiMessageDraft,
    },
    ClearAiMessages {
        id: String,
    },
    AddClinicalAlert {
        id: String,
        alert: AlertDraft,
    },
    DismissAlert {
        id: String,
        alert_id: String,
    },
    UpdateSoapSection {
        id: String,
        section: SoapSection,
        content: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    StartSoapGeneration {
        id: String,
    },
    UpdateSoapProgress {
        id: String,
        progress: f32,
    },
    CompleteSoapGeneration {
        id: String,
        soap: SoapPatch,
    },
    AddSymptom {
        id: String,
        symptom: Symptom,
    },
    RemoveSymptom {
        id: String,
        name: String,
    },
    AddDiagnosis {
        id: String,
        diagnosis: Diagnosis,
    },
    UpdateVitalSigns {
        id: String,
        vitals: VitalSignsPatch,
    },
    UpdateTreatmentPlan {
        id: String,
        plan: TreatmentPlanPatch,
    },
}

impl ConsultationAction {
    /// Consultation this action addresses, if any
    pub fn consultation_id(&self) -> Option<&str> {
        use ConsultationAction::*;
        match self {
            SetCurrent { id } => id.as_deref(),
            Start { id, .. }
            | End { id, .. }
            | Pause { id }
            | Resume { id }
            | StartRecording { id }
            | StopRecording { id }
            | UpdateLiveTranscript { id, .. }
            | FinalizeTranscript { id, .. }
            | UpdateAudioLevel { id, .. }
            | SetThinking { id, .. }
            | SetAiMode { id, .. }
            | AddAiMessage { id, .. }
            | ClearAiMessages { id }
            | AddClinicalAlert { id, .. }
            | DismissAlert { id, .. }
            | UpdateSoapSection { id, .. }
            | StartSoapGeneration { id }
            | UpdateSoapProgress { id, .. }
            | CompleteSoapGeneration { id, .. }
            | AddSymptom { id, .. }
            | RemoveSymptom { id, .. }
            | AddDiagnosis { id, .. }
            | UpdateVitalSigns { id, .. }
            | UpdateTreatmentPlan { id, .. } => Some(id.as_str()),
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Apply `action` to the slice. Returns whether anything changed.
pub fn reduce(state: &mut ConsultationState, action: &ConsultationAction, ctx: &ReduceContext) -> bool {
    use ConsultationAction::*;

    match action {
        Start { id, patient, ai_mode } => start(state, id, patient.clone(), *ai_mode, ctx.now),
        End { id, reason } => end(state, id, *reason, ctx.now),
        SetCurrent { id } => set_current(state, id.as_deref()),
        other => {
            let Some(id) = other.consultation_id() else {
                return false;
            };
            let Some(entry) = state.active.get_mut(id) else {
                tracing::debug!("Ignoring action for unknown consultation {}", id);
                return false;
            };
            let consultation = Arc::make_mut(entry);
            let changed = apply(consultation, other, ctx);
            if changed {
                consultation.touch(ctx.now);
            }
            changed
        }
    }
}

fn start(
    state: &mut ConsultationState,
    id: &str,
    patient: Option<PatientInfo>,
    ai_mode: Option<AiMode>,
    now: DateTime<Utc>,
) -> bool {
    if state.contains(id) {
        tracing::warn!("Consultation id {} already in use, ignoring start", id);
        return false;
    }

    let mut consultation = Consultation::new(id, now);
    consultation.patient = patient;
    if let Some(mode) = ai_mode {
        consultation.ai.mode = mode;
    }

    state.active.insert(id.to_string(), Arc::new(consultation));
    state.current_id = Some(id.to_string());
    push_bounded(&mut state.history, id.to_string(), HISTORY_CAP);
    tracing::info!("Started consultation {}", id);
    true
}

fn end(state: &mut ConsultationState, id: &str, reason: EndReason, now: DateTime<Utc>) -> bool {
    let Some(entry) = state.active.remove(id) else {
        return false;
    };
    let mut consultation = Arc::unwrap_or_clone(entry);
    consultation.settle_recording(now);
    consultation.transcription.is_recording = false;
    consultation.session.end_time = Some(now);
    consultation.status = match reason {
        EndReason::Completed => ConsultationStatus::Completed,
        _ => ConsultationStatus::Archived,
    };
    consultation.touch(now);

    let archived = ArchivedConsultation {
        id: consultation.id.clone(),
        status: consultation.status,
        reason,
        patient: consultation.patient.clone(),
        session: consultation.summary(now),
        documentation: consultation.documentation,
        symptoms: consultation.symptoms,
        diagnoses: consultation.diagnoses,
        treatment_plan: consultation.treatment_plan,
        metadata: consultation.metadata,
        archived_at: now,
    };
    state.archived.insert(id.to_string(), Arc::new(archived));

    if state.current_id.as_deref() == Some(id) {
        state.current_id = None;
    }
    tracing::info!("Ended consultation {} ({:?})", id, reason);
    true
}

fn set_current(state: &mut ConsultationState, id: Option<&str>) -> bool {
    match id {
        Some(id) if state.active.contains_key(id) => {
            if state.current_id.as_deref() == Some(id) {
                return false;
            }
            state.current_id = Some(id.to_string());
            true
        }
        Some(_) => false,
        None => state.current_id.take().is_some(),
    }
}

fn apply(c: &mut Consultation, action: &ConsultationAction, ctx: &ReduceContext) -> bool {
    use ConsultationAction::*;
    let now = ctx.now;

    match action {
        Pause { .. } => {
            if c.status != ConsultationStatus::Active {
                return false;
            }
            c.settle_recording(now);
            c.status = ConsultationStatus::Paused;
            c.transcription.is_paused = true;
            true
        }

        Resume { .. } => {
            if c.status != ConsultationStatus::Paused {
                return false;
            }
            c.status = ConsultationStatus::Active;
            c.transcription.is_paused = false;
            if c.transcription.is_recording {
                c.transcription.recording_started_at = Some(now);
            }
            true
        }

        StartRecording { .. } => {
            let t = &mut c.transcription;
            if t.is_recording && !t.is_paused {
                return false;
            }
            t.is_recording = true;
            t.is_paused = false;
            t.recording_started_at = Some(now);
            c.status = ConsultationStatus::Active;
            c.session.start_time.get_or_insert(now);
            true
        }

        StopRecording { .. } => {
            if !c.transcription.is_recording {
                return false;
            }
            c.settle_recording(now);
            c.transcription.is_recording = false;
            c.transcription.is_paused = false;
            true
        }

        UpdateLiveTranscript { text, confidence, .. } => {
            c.transcription.live_transcript = text.clone();
            c.transcription.confidence = confidence.clamp(0.0, 1.0);
            true
        }

        FinalizeTranscript { segment, .. } => finalize_transcript(c, segment, ctx),

        UpdateAudioLevel { level, .. } => {
            let since = now - c.metadata.last_activity;
            if since < Duration::milliseconds(AUDIO_LEVEL_THROTTLE_MS) {
                return false;
            }
            c.transcription.audio_level = if level.is_finite() {
                level.clamp(0.0, 1.0)
            } else {
                0.0
            };
            true
        }

        SetThinking { thinking, .. } => {
            if c.ai.is_thinking == *thinking {
                return false;
            }
            c.ai.is_thinking = *thinking;
            true
        }

        SetAiMode { mode, .. } => {
            if c.ai.mode == *mode {
                return false;
            }
            c.ai.mode = *mode;
            true
        }

        AddAiMessage { message, .. } => {
            let msg = AiMessage {
                id: message.id.clone().unwrap_or_else(|| ctx.ids.next_id()),
                role: message.role,
                kind: message.kind,
                content: message.content.clone(),
                confidence: message.confidence,
                timestamp: message.timestamp.unwrap_or(now),
            };
            push_bounded(&mut c.ai.messages, msg, MESSAGE_CAP);
            c.ai.is_thinking = false;
            true
        }

        ClearAiMessages { .. } => {
            if c.ai.messages.is_empty() {
                return false;
            }
            c.ai.messages.clear();
            true
        }

        AddClinicalAlert { alert, .. } => {
            let duplicate = c
                .ai
                .clinical_alerts
                .iter()
                .any(|a| a.title == alert.title && a.category == alert.category);
            if duplicate {
                tracing::debug!("Dropping duplicate clinical alert '{}'", alert.title);
                return false;
            }
            c.ai.clinical_alerts.push(ClinicalAlert {
                id: alert.id.clone().unwrap_or_else(|| ctx.ids.next_id()),
                title: alert.title.clone(),
                message: alert.message.clone(),
                category: alert.category,
                severity: alert.severity,
                timestamp: now,
                dismissed: false,
            });
            true
        }

        DismissAlert { alert_id, .. } => {
            match c
                .ai
                .clinical_alerts
                .iter_mut()
                .find(|a| &a.id == alert_id && !a.dismissed)
            {
                Some(alert) => {
                    alert.dismissed = true;
                    true
                }
                None => false,
            }
        }

        UpdateSoapSection {
            section,
            content,
            user_id,
            ..
        } => {
            let docs = &mut c.documentation;
            let previous = docs.soap.section(*section).to_string();
            push_bounded(
                &mut docs.edit_history,
                SoapEdit {
                    section: *section,
                    previous_value: previous,
                    new_value: content.clone(),
                    timestamp: now,
                    user_id: user_id.clone(),
                },
                EDIT_HISTORY_CAP,
            );
            *docs.soap.section_mut(*section) = content.clone();
            docs.last_saved = Some(now);
            true
        }

        StartSoapGeneration { .. } => {
            c.documentation.is_generating = true;
            c.documentation.generation_progress = 0.0;
            true
        }

        UpdateSoapProgress { progress, .. } => {
            let clamped = if progress.is_finite() {
                progress.clamp(0.0, 100.0)
            } else {
                0.0
            };
            c.documentation.generation_progress = clamped;
            true
        }

        CompleteSoapGeneration { soap, .. } => {
            let docs = &mut c.documentation;
            docs.soap.merge(soap);
            docs.is_generating = false;
            docs.generation_progress = 100.0;
            docs.last_saved = Some(now);
            true
        }

        AddSymptom { symptom, .. } => {
            match c
                .symptoms
                .iter_mut()
                .find(|s| s.name.eq_ignore_ascii_case(&symptom.name))
            {
                Some(existing) => *existing = symptom.clone(),
                None => c.symptoms.push(symptom.clone()),
            }
            true
        }

        RemoveSymptom { name, .. } => {
            let before = c.symptoms.len();
            c.symptoms.retain(|s| !s.name.eq_ignore_ascii_case(name));
            c.symptoms.len() != before
        }

        AddDiagnosis { diagnosis, .. } => {
            match c.diagnoses.iter_mut().find(|d| d.name == diagnosis.name) {
                Some(existing) => *existing = diagnosis.clone(),
                None => c.diagnoses.push(diagnosis.clone()),
            }
            c.diagnoses
                .sort_by(|a, b| b.probability.total_cmp(&a.probability));
            true
        }

        UpdateVitalSigns { vitals, .. } => {
            c.vital_signs.merge(vitals);
            c.vital_signs.recorded_at = Some(now);
            true
        }

        UpdateTreatmentPlan { plan, .. } => {
            c.treatment_plan.merge(plan);
            true
        }

        Start { .. } | End { .. } | SetCurrent { .. } => false,
    }
}

fn finalize_transcript(c: &mut Consultation, draft: &SegmentDraft, ctx: &ReduceContext) -> bool {
    let text = draft.text.trim();
    let t = &mut c.transcription;

    if text.is_empty() {
        let had_live = !t.live_transcript.is_empty();
        t.live_transcript.clear();
        return had_live;
    }

    if !t.final_transcript.is_empty() {
        t.final_transcript.push(' ');
    }
    t.final_transcript.push_str(text);

    let segment = TranscriptSegment {
        id: draft.id.clone().unwrap_or_else(|| ctx.ids.next_id()),
        text: text.to_string(),
        speaker: draft.speaker.clone(),
        start_ms: draft.start_ms,
        end_ms: draft.end_ms,
        confidence: draft.confidence.clamp(0.0, 1.0),
        timestamp: ctx.now,
    };
    push_bounded(&mut t.segments, segment, SEGMENT_CAP);
    t.live_transcript.clear();
    true
}
