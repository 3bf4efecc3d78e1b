use clap::{Parser, Subcommand};
use consult_core::consultation::{
    AiMessageDraft, Diagnosis, PatientInfo, SegmentDraft, SoapSection,
};
use consult_core::performance::{MobileRecommendation, OptimizationAction};
use consult_core::selectors;
use consult_core::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "consult")]
#[command(about = "Consultation state and resilience engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Load configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted consultation from start to archive
    Simulate {
        /// Patient name recorded on the consultation
        #[arg(long)]
        patient: Option<String>,

        /// Number of transcript segments to record
        #[arg(long, default_value_t = 3)]
        segments: usize,

        /// Record a working diagnosis (repeatable)
        #[arg(long)]
        diagnosis: Vec<String>,

        /// Inject a failure mid-consultation (repeatable), e.g. `ai` or `STORAGE_ERROR`
        #[arg(long, value_parser = parse_code)]
        inject: Vec<ErrorCode>,

        /// Report this memory reading instead of measuring the process
        #[arg(long)]
        memory_mb: Option<f64>,
    },

    /// Show a summary of the saved state
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the saved state as JSON
    Export,

    /// Delete all saved state in this namespace
    Clear,

    /// Report an error and run the recovery engine against it
    Recover {
        #[arg(long, value_parser = parse_code)]
        code: ErrorCode,

        #[arg(long, default_value = "Reported from the command line")]
        message: String,

        #[arg(long, value_parser = parse_severity, default_value = "medium")]
        severity: Severity,

        /// Consultation the error concerns
        #[arg(long)]
        consultation: Option<String>,

        /// Simulate a host without connectivity
        #[arg(long)]
        offline: bool,

        /// Simulate the user refusing permission prompts
        #[arg(long)]
        deny_permission: bool,
    },

    /// Sample resource usage and print optimization advice
    Advise {
        /// Treat this host as mobile
        #[arg(long)]
        mobile: bool,

        /// Use this memory reading instead of measuring the process
        #[arg(long)]
        memory_mb: Option<f64>,

        /// Latest AI response time to evaluate
        #[arg(long)]
        ai_ms: Option<f64>,

        /// Latest transcription latency to evaluate
        #[arg(long)]
        transcription_ms: Option<f64>,

        /// Latest frame render time to evaluate
        #[arg(long)]
        render_ms: Option<f64>,

        #[arg(long)]
        json: bool,
    },
}

fn parse_code(s: &str) -> std::result::Result<ErrorCode, String> {
    ErrorCode::parse(s).ok_or_else(|| format!("unknown error code: {}", s))
}

fn parse_severity(s: &str) -> std::result::Result<Severity, String> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        _ => Err(format!("unknown severity: {}", s)),
    }
}

struct App {
    config: Config,
    data_dir: PathBuf,
    platform: Arc<HostPlatform>,
}

impl App {
    fn adapter(&self) -> StorageAdapter {
        let backend = Arc::new(FileStore::new(self.data_dir.join("state")));
        StorageAdapter::new(backend, self.config.data.namespace.clone())
    }

    fn open_store(&self) -> Arc<Store> {
        Arc::new(
            Store::default().with_storage(self.adapter(), self.config.data.persist_debounce()),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    consult_core::logging::init_with_level(consult_core::logging::level_for_verbosity(cli.verbose));

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    tracing::debug!("Using data directory {:?}", data_dir);
    let app = App {
        platform: Arc::new(HostPlatform::new(data_dir.join("state"))),
        config,
        data_dir,
    };

    match cli.command {
        Commands::Simulate {
            patient,
            segments,
            diagnosis,
            inject,
            memory_mb,
        } => {
            let script = Script {
                patient,
                segments,
                diagnoses: diagnosis,
                inject,
                memory_mb,
            };
            cmd_simulate(&app, script).await
        }
        Commands::Status { json } => cmd_status(&app, json),
        Commands::Export => cmd_export(&app),
        Commands::Clear => cmd_clear(&app),
        Commands::Recover {
            code,
            message,
            severity,
            consultation,
            offline,
            deny_permission,
        } => {
            let platform = Arc::new(SimulatedPlatform::new());
            platform.set_online(!offline);
            if deny_permission {
                platform.set_default_permission(PermissionStatus::Denied);
            }
            let error = ReportedError {
                code,
                message,
                severity,
                consultation,
            };
            cmd_recover(&app, platform, error).await
        }
        Commands::Advise {
            mobile,
            memory_mb,
            ai_ms,
            transcription_ms,
            render_ms,
            json,
        } => {
            let readings = Readings {
                memory_mb,
                ai_ms,
                transcription_ms,
                render_ms,
            };
            cmd_advise(&app, mobile, readings, json).await
        }
    }
}

const SCRIPT: [&str; 5] = [
    "Patient reports a dry cough for two weeks.",
    "No fever, mild fatigue in the evenings.",
    "Lungs clear on auscultation.",
    "Blood pressure one twenty over eighty.",
    "Advised fluids and rest, review in one week.",
];

struct Script {
    patient: Option<String>,
    segments: usize,
    diagnoses: Vec<String>,
    inject: Vec<ErrorCode>,
    memory_mb: Option<f64>,
}

async fn cmd_simulate(app: &App, script: Script) -> Result<()> {
    let Script {
        patient,
        segments,
        diagnoses,
        inject,
        memory_mb,
    } = script;
    let store = app.open_store();
    let engine = ErrorRecoveryEngine::with_defaults(app.platform.clone(), &app.config.recovery);
    let monitor_platform: Arc<dyn Platform> = match memory_mb {
        Some(mb) => {
            let simulated = SimulatedPlatform::new();
            simulated.set_memory_mb(Some(mb));
            Arc::new(simulated)
        }
        None => app.platform.clone(),
    };
    let monitor = PerformanceMonitor::new(monitor_platform, store.clone(), &app.config.performance);
    let mut warnings = monitor.subscribe();

    let id = store.ids().next_id();
    store.dispatch(ConsultationAction::Start {
        id: id.clone(),
        patient: patient.map(|name| PatientInfo {
            name: Some(name),
            ..Default::default()
        }),
        ai_mode: None,
    });
    store.dispatch(ConsultationAction::StartRecording { id: id.clone() });

    for line in SCRIPT.iter().cycle().take(segments) {
        store.dispatch(ConsultationAction::FinalizeTranscript {
            id: id.clone(),
            segment: SegmentDraft::text(*line),
        });
    }
    store.dispatch(ConsultationAction::AddAiMessage {
        id: id.clone(),
        message: AiMessageDraft::suggestion("Consider a chest X-ray if the cough persists."),
    });
    for name in diagnoses {
        store.dispatch(ConsultationAction::AddDiagnosis {
            id: id.clone(),
            diagnosis: Diagnosis::new(name, 0.5),
        });
    }

    for code in inject {
        let error = MedicalError::new(
            store.ids().next_id(),
            code,
            Severity::Medium,
            format!("Simulated {}", code),
            store.now(),
        )
        .with_consultation(id.clone());
        let strategy = engine.strategy_for(&error).unwrap_or("no strategy");
        let recovered = engine.resolve(error, store.as_ref()).await;
        println!(
            "  {} {} ({})",
            if recovered { "✓ recovered" } else { "✗ unresolved" },
            code,
            strategy
        );
    }

    store.dispatch(ConsultationAction::StopRecording { id: id.clone() });
    store.dispatch(ConsultationAction::UpdateSoapSection {
        id: id.clone(),
        section: SoapSection::Subjective,
        content: "Two-week dry cough with evening fatigue.".into(),
        user_id: None,
    });
    monitor.sample().await;
    while let Ok(warning) = warnings.try_recv() {
        if let PerformanceWarning::HighMemory { usage_mb, .. } = warning {
            let recovered = engine.relieve(&warning, &store).await;
            println!(
                "  {} memory pressure at {:.0} MB (memory_pressure_relief)",
                if recovered { "✓ relieved" } else { "✗ unresolved" },
                usage_mb
            );
        }
    }
    let ai_mode = store.snapshot().consultation.get(&id).map(|c| c.ai.mode);
    store.dispatch(ConsultationAction::End {
        id: id.clone(),
        reason: EndReason::Completed,
    });

    let saved = store.flush();
    let state = store.snapshot();

    println!("\n✓ Consultation {} completed", id);
    if let Some(archived) = state.consultation.archived.get(&id) {
        println!(
            "  Transcript: {} words",
            archived.session.transcript.split_whitespace().count()
        );
        println!("  AI suggestions: {}", archived.session.ai_suggestions.len());
        for d in &archived.diagnoses {
            println!("  Diagnosis: {}", d.name);
        }
    }
    if let Some(mode) = ai_mode {
        println!("  AI mode: {:?}", mode);
    }
    println!("  Unread notifications: {}", selectors::unread_count(&state));
    if saved {
        println!("  State saved to {}", app.data_dir.display());
    } else {
        eprintln!("Warning: state could not be saved");
    }
    Ok(())
}

fn cmd_status(app: &App, json: bool) -> Result<()> {
    let store = app.open_store();
    let state = store.snapshot();
    let stats = &state.user.statistics;

    if json {
        let summary = serde_json::json!({
            "active": state.consultation.active.len(),
            "archived": state.consultation.archived.len(),
            "current": state.consultation.current_id,
            "errors": state.system.errors.len(),
            "unread_notifications": selectors::unread_count(&state),
            "total_consultations": stats.total_consultations,
            "average_session_length_ms": stats.average_session_length_ms,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Namespace: {}", app.config.data.namespace);
    println!("Active consultations: {}", state.consultation.active.len());
    for c in selectors::active_consultations(&state) {
        println!("  • {} ({:?})", c.id, c.status);
    }
    println!("Archived consultations: {}", state.consultation.archived.len());
    println!("Completed total: {}", stats.total_consultations);
    println!("Recorded errors: {}", state.system.errors.len());
    println!("Unread notifications: {}", selectors::unread_count(&state));
    for n in selectors::unread_notifications(&state) {
        println!("  • {}: {}", n.title, n.message);
    }
    Ok(())
}

fn cmd_export(app: &App) -> Result<()> {
    match app.adapter().export_state()? {
        Some(json) => println!("{}", json),
        None => println!("No saved state."),
    }
    Ok(())
}

fn cmd_clear(app: &App) -> Result<()> {
    let removed = app.adapter().clear()?;
    println!("✓ Removed {} saved key(s)", removed);
    Ok(())
}

struct ReportedError {
    code: ErrorCode,
    message: String,
    severity: Severity,
    consultation: Option<String>,
}

async fn cmd_recover(
    app: &App,
    platform: Arc<SimulatedPlatform>,
    reported: ReportedError,
) -> Result<()> {
    let store = app.open_store();
    let engine = ErrorRecoveryEngine::with_defaults(platform, &app.config.recovery);

    let code = reported.code;
    let mut error = MedicalError::new(
        store.ids().next_id(),
        code,
        reported.severity,
        reported.message,
        store.now(),
    );
    if let Some(id) = reported.consultation {
        error = error.with_consultation(id);
    }
    let strategy = engine.strategy_for(&error);
    let recovered = engine.resolve(error, store.as_ref()).await;
    store.flush();

    match (recovered, strategy) {
        (true, Some(name)) => println!("✓ Recovered {} using {}", code, name),
        (false, Some(name)) => println!("✗ {} could not recover {}", name, code),
        (_, None) => println!("✗ No recovery strategy for {}", code),
    }
    Ok(())
}

struct Readings {
    memory_mb: Option<f64>,
    ai_ms: Option<f64>,
    transcription_ms: Option<f64>,
    render_ms: Option<f64>,
}

async fn cmd_advise(app: &App, mobile: bool, readings: Readings, json: bool) -> Result<()> {
    let store = Arc::new(Store::default());
    let mut config = app.config.performance.clone();
    if mobile {
        config.force_mobile = Some(true);
    }
    let platform: Arc<dyn Platform> = match readings.memory_mb {
        Some(mb) => {
            let simulated = SimulatedPlatform::new();
            simulated.set_memory_mb(Some(mb));
            Arc::new(simulated)
        }
        None => app.platform.clone(),
    };
    let monitor = PerformanceMonitor::new(platform, store, &config);
    if let Some(ms) = readings.ai_ms {
        monitor.record_ai_response_time(ms);
    }
    if let Some(ms) = readings.transcription_ms {
        monitor.record_transcription_latency(ms);
    }
    if let Some(ms) = readings.render_ms {
        monitor.record_render_time(ms);
    }
    let metrics = monitor.sample().await;
    let actions = monitor.optimization_strategies();
    let mobile_advice = monitor.mobile_optimizations();

    if json {
        let report = serde_json::json!({
            "memory_usage_mb": metrics.memory_usage_mb,
            "storage_usage_mb": metrics.storage_usage_mb,
            "battery_impact": metrics.battery_impact,
            "optimizations": actions,
            "mobile": mobile_advice,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Memory: {:.1} MB", metrics.memory_usage_mb);
    println!("Storage: {:.1} MB", metrics.storage_usage_mb);
    if monitor.is_mobile() {
        println!("Battery impact: {:?}", metrics.battery_impact);
        println!("Memory limit: {:.0} MB", mobile_advice.memory_limit_mb);
    }
    print_optimizations(&actions);
    for rec in &mobile_advice.recommendations {
        let text = match rec {
            MobileRecommendation::DisableAdvancedAi => "Switch AI assistance to basic mode",
            MobileRecommendation::DisableRealTimeTranscription => "Turn off real-time transcription",
            MobileRecommendation::DisableAutoAiSuggestions => "Turn off automatic AI suggestions",
        };
        println!("  → {}", text);
    }
    Ok(())
}

fn print_optimizations(actions: &[OptimizationAction]) {
    if actions.is_empty() {
        println!("✓ No optimizations needed");
        return;
    }
    println!("Recommended optimizations:");
    for action in actions {
        println!(
            "  {}. {:?} [{:?} impact]: {}",
            action.priority, action.kind, action.impact, action.description
        );
    }
}
