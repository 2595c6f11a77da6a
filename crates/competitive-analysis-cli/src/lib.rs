//! `cca` command surface: form submissions, the filtered dataset view, and the
//! form catalogue.
//!
//! Embedders can drive the same behavior through [`run_cli`] with a parsed
//! [`Cli`], or through [`run_command`] against an existing session.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{Args, Parser, Subcommand};
use competitive_analysis_core::{
    AnalysisMonth, AnalysisTable, FieldKind, FieldValue, FormKind, FormSubmission, LedgerError,
    RecordId, INSTITUTION_TYPES, NARRATIVE_VOICES, WEB_DESIGN_LAYOUTS, WEB_IMAGERY_STYLES,
};
use competitive_analysis_store::{
    AnalysisSession, BlobStore, LocalFsBlobStore, ObjectLocation, RecordStore, DEFAULT_BUCKET,
    DEFAULT_KEY,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cca")]
#[command(about = "Competitive analysis record ledger")]
pub struct Cli {
    /// Directory holding one sub-directory per bucket.
    #[arg(long, global = true, env = "CCA_STORE_ROOT", default_value = "./cca-store")]
    store_root: PathBuf,

    #[arg(long, global = true, env = "CCA_BUCKET", default_value = DEFAULT_BUCKET)]
    bucket: String,

    #[arg(long, global = true, env = "CCA_KEY", default_value = DEFAULT_KEY)]
    key: String,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, env = "CCA_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_json(&self) -> bool {
        self.log_json
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit one form against the dataset.
    Submit {
        #[command(subcommand)]
        command: Box<SubmitCommand>,
    },
    /// Show the dataset, optionally filtered on one column.
    View(ViewArgs),
    /// List the distinct values of a column.
    Values(ValuesArgs),
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    /// Describe every form and its fields.
    Forms(FormsArgs),
}

#[derive(Debug, Subcommand)]
pub enum SubmitCommand {
    Institution(InstitutionArgs),
    NarrativeArchetypes(ArchetypeUpdateArgs),
    WebDesignArchetypes(ArchetypeUpdateArgs),
    WebImageryArchetypes(ArchetypeUpdateArgs),
    NarrativeNotes(NarrativeNotesArgs),
    WebDesignNotes(WebDesignNotesArgs),
    WebImageryNotes(WebImageryNotesArgs),
}

/// Ten archetype percentages in colour order. Each defaults to 10.
#[derive(Debug, Clone, Args)]
pub struct ArchetypeArgs {
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    purple: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    green: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    blue: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    maroon: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    yellow: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    orange: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    pink: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    red: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    silver: i64,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    beige: i64,
}

impl ArchetypeArgs {
    fn values(&self) -> [i64; 10] {
        [
            self.purple,
            self.green,
            self.blue,
            self.maroon,
            self.yellow,
            self.orange,
            self.pink,
            self.red,
            self.silver,
            self.beige,
        ]
    }
}

#[derive(Debug, Args)]
pub struct InstitutionArgs {
    /// 0 appends a new record; any other id updates that record.
    #[arg(long, default_value_t = 0)]
    record_id: u64,
    #[arg(long)]
    full_name: String,
    #[arg(long)]
    abbreviation: String,
    #[arg(long = "type", value_parser = PossibleValuesParser::new(INSTITUTION_TYPES.iter().copied()))]
    institution_type: String,
    /// Defaults to the current UTC month.
    #[arg(long)]
    analysis_month: Option<AnalysisMonth>,
    #[arg(long)]
    client_institution: String,
    #[arg(long)]
    website_url: String,
    #[command(flatten)]
    archetypes: ArchetypeArgs,
}

#[derive(Debug, Args)]
pub struct ArchetypeUpdateArgs {
    #[arg(long)]
    record_id: u64,
    #[command(flatten)]
    archetypes: ArchetypeArgs,
}

#[derive(Debug, Args)]
pub struct NarrativeNotesArgs {
    #[arg(long)]
    record_id: u64,
    #[arg(long)]
    tagline: Option<String>,
    #[arg(long, value_parser = PossibleValuesParser::new(NARRATIVE_VOICES.iter().copied()))]
    voice: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct WebDesignNotesArgs {
    #[arg(long)]
    record_id: u64,
    #[arg(long, value_parser = PossibleValuesParser::new(WEB_DESIGN_LAYOUTS.iter().copied()))]
    layout: Option<String>,
    #[arg(long)]
    palette: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct WebImageryNotesArgs {
    #[arg(long)]
    record_id: u64,
    #[arg(long)]
    subjects: Option<String>,
    #[arg(long, value_parser = PossibleValuesParser::new(WEB_IMAGERY_STYLES.iter().copied()))]
    style: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    #[arg(long, requires = "equals")]
    column: Option<String>,
    #[arg(long, requires = "column")]
    equals: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ValuesArgs {
    #[arg(long)]
    column: String,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Show(RecordShowArgs),
}

#[derive(Debug, Args)]
pub struct RecordShowArgs {
    #[arg(long)]
    record_id: RecordId,
}

#[derive(Debug, Args)]
pub struct FormsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ColumnValues<'a> {
    column: &'a str,
    values: Vec<String>,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the `warn`
/// default.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Executes the parsed CLI against the configured local store.
///
/// # Errors
/// Returns an error when validation, the upsert, or storage access fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let location = ObjectLocation::new(cli.bucket, cli.key);
    debug!(
        store_root = %cli.store_root.display(),
        location = %location,
        "opening dataset"
    );
    let store = RecordStore::new(LocalFsBlobStore::new(cli.store_root), location);
    let mut session = AnalysisSession::new(store);
    run_command(cli.command, &mut session)
}

/// Executes one command against an existing session.
///
/// # Errors
/// Returns an error when validation, the upsert, or storage access fails.
pub fn run_command<B: BlobStore>(command: Command, session: &mut AnalysisSession<B>) -> Result<()> {
    match command {
        Command::Submit { command } => {
            let submission = build_submission(*command)?;
            let receipt = session.submit(&submission)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Command::View(args) => {
            let table = session.table().context("failed to load dataset")?;
            let table = match (args.column.as_deref(), args.equals.as_deref()) {
                (Some(column), Some(value)) => table.filter(column, value)?,
                _ => table.clone(),
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&table.to_json_rows())?);
            } else {
                print!("{}", render_table(&table));
            }
            Ok(())
        }
        Command::Values(args) => {
            let table = session.table().context("failed to load dataset")?;
            let values = table.distinct_values(&args.column)?;
            let payload = ColumnValues {
                column: &args.column,
                values,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::Record {
            command: RecordCommand::Show(args),
        } => {
            let table = session.table().context("failed to load dataset")?;
            let record = table
                .record(args.record_id)
                .ok_or(LedgerError::RecordNotFound(args.record_id))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&table.record_to_json(record))?
            );
            Ok(())
        }
        Command::Forms(args) => {
            let forms = FormKind::ALL.map(FormKind::spec);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&forms)?);
            } else {
                print!("{}", render_forms());
            }
            Ok(())
        }
    }
}

fn build_submission(command: SubmitCommand) -> Result<FormSubmission> {
    let submission = match command {
        SubmitCommand::Institution(args) => {
            let month = args.analysis_month.unwrap_or_else(AnalysisMonth::current);
            let submission = FormSubmission::new(FormKind::InstitutionInfo, args.record_id)
                .with_field("Full Name", FieldValue::text(args.full_name))
                .with_field("Abbreviation", FieldValue::text(args.abbreviation))
                .with_field("Type", FieldValue::text(args.institution_type))
                .with_field("Analysis Date", FieldValue::Month(month))
                .with_field("Client Institution", FieldValue::text(args.client_institution))
                .with_field("Website URL", FieldValue::text(args.website_url));
            with_archetypes(submission, &args.archetypes)
        }
        SubmitCommand::NarrativeArchetypes(args) => with_archetypes(
            FormSubmission::new(FormKind::NarrativeArchetypes, args.record_id),
            &args.archetypes,
        ),
        SubmitCommand::WebDesignArchetypes(args) => with_archetypes(
            FormSubmission::new(FormKind::WebDesignArchetypes, args.record_id),
            &args.archetypes,
        ),
        SubmitCommand::WebImageryArchetypes(args) => with_archetypes(
            FormSubmission::new(FormKind::WebImageryArchetypes, args.record_id),
            &args.archetypes,
        ),
        SubmitCommand::NarrativeNotes(args) => with_notes(
            FormSubmission::new(FormKind::NarrativeNotes, args.record_id),
            [
                ("Narrative Tagline", args.tagline),
                ("Narrative Voice", args.voice),
                ("Narrative Notes", args.notes),
            ],
        )?,
        SubmitCommand::WebDesignNotes(args) => with_notes(
            FormSubmission::new(FormKind::WebDesignNotes, args.record_id),
            [
                ("Web Design Layout", args.layout),
                ("Web Design Palette", args.palette),
                ("Web Design Notes", args.notes),
            ],
        )?,
        SubmitCommand::WebImageryNotes(args) => with_notes(
            FormSubmission::new(FormKind::WebImageryNotes, args.record_id),
            [
                ("Web Imagery Subjects", args.subjects),
                ("Web Imagery Style", args.style),
                ("Web Imagery Notes", args.notes),
            ],
        )?,
    };
    Ok(submission)
}

fn with_archetypes(submission: FormSubmission, archetypes: &ArchetypeArgs) -> FormSubmission {
    let columns = submission
        .form
        .spec()
        .percentage_fields()
        .map(|field| field.name.clone())
        .collect::<Vec<_>>();
    columns
        .into_iter()
        .zip(archetypes.values())
        .fold(submission, |submission, (column, value)| {
            submission.with_field(column, FieldValue::Integer(value))
        })
}

/// Notes forms only send the fields that were given.
fn with_notes(
    submission: FormSubmission,
    fields: [(&str, Option<String>); 3],
) -> Result<FormSubmission> {
    if fields.iter().all(|(_, value)| value.is_none()) {
        let flags = submission
            .form
            .spec()
            .fields
            .iter()
            .map(|field| field.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        bail!(
            "{} needs at least one field ({flags})",
            submission.form.title()
        );
    }
    Ok(fields
        .into_iter()
        .fold(submission, |submission, (column, value)| match value {
            Some(value) => submission.with_field(column, FieldValue::text(value)),
            None => submission,
        }))
}

/// Plain aligned dump of the table. Line breaks inside cells are flattened so
/// each record stays on one line.
fn render_table(table: &AnalysisTable) -> String {
    let rows = table
        .records()
        .iter()
        .map(|record| {
            table
                .columns()
                .iter()
                .map(|column| AnalysisTable::cell(record, column).replace(['\r', '\n'], " "))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let widths = table
        .columns()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            rows.iter()
                .map(|row| row[index].chars().count())
                .chain(std::iter::once(column.chars().count()))
                .max()
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();

    let mut out = String::new();
    push_row(&mut out, table.columns(), &widths);
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)));
    out.push('\n');
    for row in &rows {
        push_row(&mut out, row, &widths);
    }
    out.push_str(&format!("({} rows)\n", rows.len()));
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    out.push_str(line.trim_end());
    out.push('\n');
}

fn render_forms() -> String {
    let mut out = String::new();
    for form in FormKind::ALL {
        let spec = form.spec();
        let create = if spec.allows_create { "creates records" } else { "updates only" };
        out.push_str(&format!("{} [{}] ({create})\n", spec.title, spec.form));
        for field in &spec.fields {
            let kind = match field.kind {
                FieldKind::Text => "text".to_string(),
                FieldKind::Choice(options) => format!("choice: {}", options.join(" | ")),
                FieldKind::Percentage => "percentage".to_string(),
                FieldKind::Month => "month (YYYY-MM)".to_string(),
            };
            out.push_str(&format!("  {:<24} {kind}\n", field.name));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use competitive_analysis_store::{InMemoryBlobStore, SubmissionError};
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(std::iter::once("cca").chain(args.iter().copied())) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    fn memory_session() -> AnalysisSession<InMemoryBlobStore> {
        AnalysisSession::new(RecordStore::new(
            InMemoryBlobStore::new(),
            ObjectLocation::default(),
        ))
    }

    fn execute(session: &mut AnalysisSession<InMemoryBlobStore>, args: &[&str]) -> Result<()> {
        run_command(parse(args).command, session)
    }

    const INSTITUTION: &[&str] = &[
        "submit",
        "institution",
        "--full-name",
        "Harbor State University",
        "--abbreviation",
        "HSU",
        "--type",
        "Public",
        "--analysis-month",
        "2024-06",
        "--client-institution",
        "Bayview College",
        "--website-url",
        "https://harbor.example.edu",
    ];

    #[test]
    fn institution_defaults_submit_ten_percent_each() {
        let Command::Submit { command } = parse(INSTITUTION).command else {
            panic!("expected submit command");
        };
        let submission = must(build_submission(*command));
        assert_eq!(submission.form, FormKind::InstitutionInfo);
        assert_eq!(submission.record_id, 0);
        assert_eq!(submission.percentage_total(), 100);
        assert_eq!(submission.field("Beige"), Some(&FieldValue::Integer(10)));
        assert_eq!(
            submission.field("Analysis Date"),
            Some(&FieldValue::Month(match AnalysisMonth::new(2024, 6) {
                Ok(month) => month,
                Err(err) => panic!("invalid month: {err}"),
            }))
        );
    }

    #[test]
    fn web_archetype_flags_map_to_prefixed_columns() {
        let Command::Submit { command } = parse(&[
            "submit",
            "web-design-archetypes",
            "--record-id",
            "3",
            "--purple",
            "55",
            "--green",
            "5",
            "--blue",
            "0",
            "--maroon",
            "0",
        ])
        .command
        else {
            panic!("expected submit command");
        };
        let submission = must(build_submission(*command));
        assert_eq!(submission.record_id, 3);
        assert_eq!(
            submission.field("Web Design Purple"),
            Some(&FieldValue::Integer(55))
        );
        assert_eq!(submission.field("Purple"), None);
        assert_eq!(submission.percentage_total(), 120);
    }

    #[test]
    fn notes_forms_send_only_given_fields() {
        let Command::Submit { command } = parse(&[
            "submit",
            "narrative-notes",
            "--record-id",
            "1",
            "--voice",
            "Conversational",
        ])
        .command
        else {
            panic!("expected submit command");
        };
        let submission = must(build_submission(*command));
        assert_eq!(submission.fields.len(), 1);
        assert_eq!(
            submission.field("Narrative Voice"),
            Some(&FieldValue::text("Conversational"))
        );
    }

    #[test]
    fn notes_form_without_fields_is_rejected() {
        let Command::Submit { command } =
            parse(&["submit", "web-imagery-notes", "--record-id", "1"]).command
        else {
            panic!("expected submit command");
        };
        let err = match build_submission(*command) {
            Ok(_) => panic!("expected empty notes submission to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("Web Imagery Notes"));
    }

    #[test]
    fn unknown_choice_is_rejected_by_parser() {
        let mut args = INSTITUTION.to_vec();
        args[7] = "Boarding";
        assert!(Cli::try_parse_from(std::iter::once("cca").chain(args)).is_err());
    }

    #[test]
    fn submit_then_merge_through_session() {
        let mut session = memory_session();
        must(execute(&mut session, INSTITUTION));
        must(execute(
            &mut session,
            &[
                "submit",
                "web-design-notes",
                "--record-id",
                "1",
                "--layout",
                "Grid",
                "--palette",
                "navy, gold",
            ],
        ));

        let table = must(session.reload().map_err(anyhow::Error::from)).clone();
        assert_eq!(table.len(), 1);
        let record = match table.record(RecordId(1)) {
            Some(record) => record,
            None => panic!("record 1 missing"),
        };
        assert_eq!(record.get("Web Design Layout"), Some(&FieldValue::text("Grid")));
        assert_eq!(record.get("Full Name"), Some(&FieldValue::text("Harbor State University")));
    }

    #[test]
    fn percentage_failure_surfaces_typed_error() {
        let mut session = memory_session();
        let mut args = INSTITUTION.to_vec();
        args.extend(["--purple", "0"]);

        let err = match execute(&mut session, &args) {
            Ok(()) => panic!("expected percentage failure"),
            Err(err) => err,
        };
        assert_eq!(
            err.to_string(),
            "percentage total must equal 100 for institution_info, got 90"
        );
        assert!(matches!(
            err.downcast_ref::<SubmissionError>(),
            Some(SubmissionError::Ledger(LedgerError::PercentageSum { total: 90, .. }))
        ));
        assert!(session
            .store()
            .backend()
            .object(DEFAULT_BUCKET, DEFAULT_KEY)
            .is_none());
    }

    #[test]
    fn record_show_of_missing_id_fails() {
        let mut session = memory_session();
        let err = match execute(&mut session, &["record", "show", "--record-id", "4"]) {
            Ok(()) => panic!("expected missing record"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "record not found: 4");
    }

    #[test]
    fn view_filter_requires_both_flags() {
        assert!(Cli::try_parse_from(["cca", "view", "--column", "Type"]).is_err());
        assert!(Cli::try_parse_from(["cca", "view", "--column", "Type", "--equals", "Public"]).is_ok());
    }

    #[test]
    fn render_table_aligns_columns() {
        let mut table = AnalysisTable::empty();
        must(
            table
                .apply(
                    0,
                    &[
                        ("Abbreviation".to_string(), FieldValue::text("HSU")),
                        ("Narrative Notes".to_string(), FieldValue::text("two\nlines")),
                    ],
                    true,
                )
                .map_err(anyhow::Error::from),
        );

        assert_eq!(
            render_table(&table),
            "Record ID  Abbreviation  Narrative Notes\n\
             ----------------------------------------\n\
             1          HSU           two lines\n\
             (1 rows)\n"
        );
    }

    #[test]
    fn render_forms_lists_every_form() {
        let rendered = render_forms();
        for form in FormKind::ALL {
            assert!(rendered.contains(form.as_str()), "missing {form}");
        }
        assert!(rendered.contains("choice: Community College | Private"));
    }

    #[test]
    fn run_cli_writes_under_store_root() {
        let root = std::env::temp_dir().join(format!("cca-cli-test-{}", ulid::Ulid::new()));
        let root_arg = root.to_string_lossy().to_string();
        let mut args = vec!["--store-root", root_arg.as_str(), "--bucket", "Reviews"];
        args.extend_from_slice(INSTITUTION);

        must(run_cli(parse(&args)));
        let written = must(fs::read_to_string(root.join("Reviews").join(DEFAULT_KEY)).map_err(anyhow::Error::from));
        assert!(written.starts_with("Record ID,Full Name,Abbreviation,Type,Analysis Date"));
        assert!(written.contains("1,Harbor State University,HSU,Public,2024-06"));

        let _ = fs::remove_dir_all(&root);
    }
}
