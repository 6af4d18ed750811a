//! GradeGuard - exam cycle and grade-integrity CLI
//!
//! The `gradeguard` command drives the exam cycle lifecycle, grade
//! moderation and post-lock overrides against the configured store.
//! Every command prints its result as JSON on stdout.
//!
//! ## Commands
//!
//! - `cycle`: create, advance, lock/unlock, publish and archive exam cycles
//! - `assessment`: register assessments and their rosters
//! - `grade`: record grades and show their history
//! - `moderation`: submit, advance, approve and reject grade moderations
//! - `override`: request, approve and reject post-lock grade changes
//! - `audit`: relay or inspect the audit outbox

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, Level};

use gradeguard_core::telemetry::init_tracing;
use gradeguard_core::{
    Actor, AssessmentDraft, AssessmentId, AuditSink, CycleDraft, CycleOperation, ExamCycleId,
    ExamType, Grade, GradeGuardConfig, GradeGuardService, GradeId, GradeModeration,
    GradebookStore, ModerationId, ModerationStage, OverrideId, PostLockGradeChange, StudentId,
    SurrealGradebookStore, TracingAuditSink, METRICS, VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "gradeguard")]
#[command(version = VERSION)]
#[command(about = "Exam cycle lifecycle and grade-integrity control", long_about = None)]
struct Cli {
    /// Identity performing the operation
    #[arg(long, global = true, env = "GRADEGUARD_ACTOR", default_value = "")]
    actor: String,

    /// Tenant (school) the actor belongs to
    #[arg(long, global = true, env = "GRADEGUARD_TENANT", default_value = "")]
    tenant: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Exam cycle lifecycle
    Cycle {
        #[command(subcommand)]
        action: CycleAction,
    },

    /// Assessments and rosters
    Assessment {
        #[command(subcommand)]
        action: AssessmentAction,
    },

    /// Direct grade entry
    Grade {
        #[command(subcommand)]
        action: GradeAction,
    },

    /// Grade moderation workflow
    Moderation {
        #[command(subcommand)]
        action: ModerationAction,
    },

    /// Post-lock grade changes
    Override {
        #[command(subcommand)]
        action: OverrideAction,
    },

    /// Audit outbox
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand, Debug)]
enum CycleAction {
    /// Create a cycle in `planning`
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        academic_year: String,

        #[arg(long)]
        term: String,

        /// formative, summative, mid_term or final
        #[arg(long, default_value = "summative")]
        exam_type: String,

        /// First exam day (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last exam day (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Allow locking without grade moderation
        #[arg(long)]
        no_moderation: bool,
    },

    /// Set the exam window
    Window {
        id: String,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,
    },

    /// Bring an assessment under the cycle
    Attach {
        id: String,

        #[arg(long)]
        assessment: String,
    },

    /// Apply a lifecycle operation (schedule, begin, end_exams,
    /// submit_for_moderation, approve_moderation, lock, publish, unlock)
    Advance { id: String, operation: String },

    /// Lock the cycle's grades
    Lock { id: String },

    /// Administrative unlock back to `approved`
    Unlock { id: String },

    /// Publish a locked cycle
    Publish { id: String },

    /// Retire a planning or published cycle
    Archive { id: String },

    /// Recompute the aggregate moderation status
    Refresh { id: String },

    /// Show one cycle
    Show { id: String },

    /// List the tenant's cycles
    List,
}

#[derive(Subcommand, Debug)]
enum AssessmentAction {
    /// Register an assessment
    Register {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        subject: String,

        #[arg(long)]
        max_score: f64,

        /// Rostered student id (repeatable)
        #[arg(long = "student")]
        students: Vec<String>,
    },

    /// Show one assessment
    Show { id: String },

    /// List the grades recorded against an assessment
    Grades { id: String },
}

#[derive(Subcommand, Debug)]
enum GradeAction {
    /// Create or update a student's grade
    Record {
        #[arg(long)]
        assessment: String,

        #[arg(long)]
        student: String,

        #[arg(long)]
        score: f64,

        #[arg(long, default_value = "")]
        remarks: String,
    },

    /// Show one grade
    Show { id: String },

    /// Show a grade with its moderation and override history
    History { id: String },
}

#[derive(Subcommand, Debug)]
enum ModerationAction {
    /// Open a moderation for a grade
    Submit {
        #[arg(long)]
        grade: String,

        #[arg(long, default_value = "")]
        reason: String,

        /// Cycle the moderation is raised under
        #[arg(long)]
        cycle: Option<String>,
    },

    /// Move to the next stage, optionally proposing a score
    Advance {
        id: String,

        /// teacher_submitted, hod_review, admin_approval or principal_approval
        #[arg(long)]
        to: String,

        #[arg(long)]
        score: Option<f64>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Approve at the final stage
    Approve { id: String },

    /// Reject and close
    Reject {
        id: String,

        #[arg(long)]
        reason: String,
    },

    /// Show one moderation
    Show { id: String },
}

#[derive(Subcommand, Debug)]
enum OverrideAction {
    /// Request a change to a locked grade
    Request {
        #[arg(long)]
        grade: String,

        #[arg(long)]
        score: f64,

        #[arg(long)]
        justification: String,
    },

    /// Approve a pending change (not by its requester)
    Approve { id: String },

    /// Reject a pending change
    Reject {
        id: String,

        #[arg(long)]
        reason: String,
    },

    /// Show one change request
    Show { id: String },
}

#[derive(Subcommand, Debug)]
enum AuditAction {
    /// Deliver pending audit events to the log sink
    Relay,

    /// List events still waiting in the outbox
    Pending {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct GradeHistory {
    grade: Grade,
    moderations: Vec<GradeModeration>,
    overrides: Vec<PostLockGradeChange>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let actor = actor_from(&cli)?;
    let config = GradeGuardConfig::from_env().context("Failed to load GradeGuard config")?;
    let store = SurrealGradebookStore::from_env()
        .await
        .context("Failed to open the GradeGuard store")?;
    let service = GradeGuardService::new(store, TracingAuditSink).with_config(config)?;
    info!(actor = %actor, version = VERSION, "gradeguard ready");

    let outcome = run(&service, &actor, cli.command).await;
    METRICS.flush();
    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn actor_from(cli: &Cli) -> Result<Actor> {
    if cli.actor.trim().is_empty() {
        return Err(anyhow!("--actor (or GRADEGUARD_ACTOR) is required"));
    }
    if cli.tenant.trim().is_empty() {
        return Err(anyhow!("--tenant (or GRADEGUARD_TENANT) is required"));
    }
    Ok(Actor::new(cli.actor.trim(), cli.tenant.trim()))
}

fn parse_id<T>(raw: &str, what: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(raw.trim()).ok_or_else(|| anyhow!("invalid {what} id: {raw}"))
}

fn cycle_id(raw: &str) -> Result<ExamCycleId> {
    parse_id(raw, "exam cycle", ExamCycleId::parse)
}

fn assessment_id(raw: &str) -> Result<AssessmentId> {
    parse_id(raw, "assessment", AssessmentId::parse)
}

fn grade_id(raw: &str) -> Result<GradeId> {
    parse_id(raw, "grade", GradeId::parse)
}

fn moderation_id(raw: &str) -> Result<ModerationId> {
    parse_id(raw, "moderation", ModerationId::parse)
}

fn override_id(raw: &str) -> Result<OverrideId> {
    parse_id(raw, "override", OverrideId::parse)
}

fn cycle_operation(raw: &str) -> Result<CycleOperation> {
    let wanted = raw.trim().replace('-', "_");
    CycleOperation::ALL
        .into_iter()
        .find(|op| op.as_str() == wanted)
        .ok_or_else(|| anyhow!("unknown cycle operation: {raw}"))
}

fn moderation_stage(raw: &str) -> Result<ModerationStage> {
    ModerationStage::parse(&raw.trim().replace('-', "_"))
        .ok_or_else(|| anyhow!("unknown moderation stage: {raw}"))
}

fn exam_type(raw: &str) -> Result<ExamType> {
    serde_json::from_value(Value::String(raw.trim().replace('-', "_")))
        .map_err(|_| anyhow!("unknown exam type: {raw}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

async fn run<S, A>(svc: &GradeGuardService<S, A>, actor: &Actor, command: Commands) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match command {
        Commands::Cycle { action } => cmd_cycle(svc, actor, action).await,
        Commands::Assessment { action } => cmd_assessment(svc, actor, action).await,
        Commands::Grade { action } => cmd_grade(svc, actor, action).await,
        Commands::Moderation { action } => cmd_moderation(svc, actor, action).await,
        Commands::Override { action } => cmd_override(svc, actor, action).await,
        Commands::Audit { action } => cmd_audit(svc, action).await,
    }
}

async fn cmd_cycle<S, A>(
    svc: &GradeGuardService<S, A>,
    actor: &Actor,
    action: CycleAction,
) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        CycleAction::Create {
            name,
            academic_year,
            term,
            exam_type: raw_type,
            start,
            end,
            no_moderation,
        } => {
            let draft = CycleDraft {
                academic_year,
                term,
                name,
                exam_type: exam_type(&raw_type)?,
                start_date: start,
                end_date: end,
                moderation_required: no_moderation.then_some(false),
            };
            to_json(&svc.create_cycle(actor, draft).await?)
        }
        CycleAction::Window { id, start, end } => {
            to_json(&svc.set_exam_window(actor, &cycle_id(&id)?, start, end).await?)
        }
        CycleAction::Attach { id, assessment } => to_json(
            &svc.attach_assessment(actor, &cycle_id(&id)?, &assessment_id(&assessment)?)
                .await?,
        ),
        CycleAction::Advance { id, operation } => {
            let op = cycle_operation(&operation)?;
            to_json(&svc.transition(actor, &cycle_id(&id)?, op).await?)
        }
        CycleAction::Lock { id } => to_json(&svc.lock(actor, &cycle_id(&id)?).await?),
        CycleAction::Unlock { id } => to_json(&svc.unlock(actor, &cycle_id(&id)?).await?),
        CycleAction::Publish { id } => to_json(&svc.publish(actor, &cycle_id(&id)?).await?),
        CycleAction::Archive { id } => to_json(&svc.archive(actor, &cycle_id(&id)?).await?),
        CycleAction::Refresh { id } => to_json(
            &svc.refresh_moderation_status(actor, &cycle_id(&id)?)
                .await?,
        ),
        CycleAction::Show { id } => to_json(&svc.get_cycle(actor, &cycle_id(&id)?).await?),
        CycleAction::List => to_json(&svc.list_cycles(actor).await?),
    }
}

async fn cmd_assessment<S, A>(
    svc: &GradeGuardService<S, A>,
    actor: &Actor,
    action: AssessmentAction,
) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        AssessmentAction::Register {
            name,
            subject,
            max_score,
            students,
        } => {
            let draft = AssessmentDraft {
                name,
                subject,
                max_score,
                roster: students.into_iter().map(StudentId::new).collect(),
            };
            to_json(&svc.register_assessment(actor, draft).await?)
        }
        AssessmentAction::Show { id } => {
            to_json(&svc.get_assessment(actor, &assessment_id(&id)?).await?)
        }
        AssessmentAction::Grades { id } => {
            to_json(&svc.grades_for_assessment(actor, &assessment_id(&id)?).await?)
        }
    }
}

async fn cmd_grade<S, A>(
    svc: &GradeGuardService<S, A>,
    actor: &Actor,
    action: GradeAction,
) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        GradeAction::Record {
            assessment,
            student,
            score,
            remarks,
        } => to_json(
            &svc.record_grade(
                actor,
                &assessment_id(&assessment)?,
                &StudentId::new(student),
                score,
                &remarks,
            )
            .await?,
        ),
        GradeAction::Show { id } => to_json(&svc.get_grade(actor, &grade_id(&id)?).await?),
        GradeAction::History { id } => {
            let id = grade_id(&id)?;
            let history = GradeHistory {
                grade: svc.get_grade(actor, &id).await?,
                moderations: svc.moderations_for_grade(actor, &id).await?,
                overrides: svc.overrides_for_grade(actor, &id).await?,
            };
            to_json(&history)
        }
    }
}

async fn cmd_moderation<S, A>(
    svc: &GradeGuardService<S, A>,
    actor: &Actor,
    action: ModerationAction,
) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        ModerationAction::Submit {
            grade,
            reason,
            cycle,
        } => {
            let cycle = cycle.as_deref().map(cycle_id).transpose()?;
            to_json(
                &svc.submit_moderation(actor, &grade_id(&grade)?, &reason, cycle)
                    .await?,
            )
        }
        ModerationAction::Advance {
            id,
            to,
            score,
            reason,
        } => to_json(
            &svc.advance_moderation(
                actor,
                &moderation_id(&id)?,
                moderation_stage(&to)?,
                score,
                reason,
            )
            .await?,
        ),
        ModerationAction::Approve { id } => to_json(
            &svc.approve_grade_moderation(actor, &moderation_id(&id)?)
                .await?,
        ),
        ModerationAction::Reject { id, reason } => to_json(
            &svc.reject_grade_moderation(actor, &moderation_id(&id)?, &reason)
                .await?,
        ),
        ModerationAction::Show { id } => {
            to_json(&svc.get_moderation(actor, &moderation_id(&id)?).await?)
        }
    }
}

async fn cmd_override<S, A>(
    svc: &GradeGuardService<S, A>,
    actor: &Actor,
    action: OverrideAction,
) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        OverrideAction::Request {
            grade,
            score,
            justification,
        } => to_json(
            &svc.request_override(actor, &grade_id(&grade)?, score, &justification)
                .await?,
        ),
        OverrideAction::Approve { id } => {
            to_json(&svc.approve_override(actor, &override_id(&id)?).await?)
        }
        OverrideAction::Reject { id, reason } => to_json(
            &svc.reject_override(actor, &override_id(&id)?, &reason)
                .await?,
        ),
        OverrideAction::Show { id } => {
            to_json(&svc.get_override(actor, &override_id(&id)?).await?)
        }
    }
}

async fn cmd_audit<S, A>(svc: &GradeGuardService<S, A>, action: AuditAction) -> Result<Value>
where
    S: GradebookStore,
    A: AuditSink,
{
    match action {
        AuditAction::Relay => {
            let delivered = svc.relay_audit().await?;
            Ok(serde_json::json!({ "delivered": delivered }))
        }
        AuditAction::Pending { limit } => {
            let pending = svc
                .store()
                .pending_audit(limit)
                .await
                .context("Failed to read the audit outbox")?;
            to_json(&pending)
        }
    }
}
