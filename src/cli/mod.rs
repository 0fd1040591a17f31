//! CLI subcommands — init, validate, plan, apply, destroy, status.
//!
//! Exit codes distinguish the failure class: 2 for template errors
//! (parse/validation/resolution/cycle) detected before provisioning, 3 for a
//! provisioning failure (rollback succeeded), 4 for a rollback failure that
//! needs operator intervention, 1 for everything else.

use crate::core::engine::{self, ApplyOptions, DestroyOptions};
use crate::core::error::EngineError;
use crate::core::parser::{self, ParseError};
use crate::core::types::{PlanAction, ResourceState, StackPlan, StackTemplate};
use crate::core::{graph, plan, state};
use crate::provider::local::LocalProvider;
use clap::Subcommand;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0} validation error(s)")]
    Validation(usize),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0} resource(s) failed; created resources were rolled back")]
    Provisioning(u32),

    #[error("rollback failed for {0} resource(s); the target state is ambiguous and needs operator intervention")]
    Rollback(u32),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) | Self::Validation(_) => 2,
            Self::Engine(EngineError::Resolution { .. } | EngineError::Graph(_)) => 2,
            Self::Engine(EngineError::State(_)) | Self::Usage(_) => 1,
            Self::Provisioning(_) => 3,
            Self::Rollback(_) => 4,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a stack document without touching any provider
    Validate {
        /// Path to the stack document
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Show what apply would change
    Plan {
        /// Path to the stack document
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// Stack name (default: document file stem)
        #[arg(long)]
        stack: Option<String>,

        /// Parameter override, key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Provision the stack to its desired state
    Apply {
        /// Path to the stack document
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// Stack name (default: document file stem)
        #[arg(long)]
        stack: Option<String>,

        /// Parameter override, key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Maximum provider calls in flight at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Per-provider-call timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Show the plan without making provider calls
        #[arg(long)]
        dry_run: bool,

        /// Re-apply resources that plan as unchanged
        #[arg(long)]
        force: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Delete every recorded resource, newest first
    Destroy {
        /// Path to the stack document (used for the default stack name)
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,

        /// Stack name (default: document file stem)
        #[arg(long)]
        stack: Option<String>,

        /// Per-provider-call timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show recorded stack state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this stack
        #[arg(long)]
        stack: Option<String>,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), CliError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            file,
            stack,
            params,
            state_dir,
        } => cmd_plan(&file, stack.as_deref(), &params, &state_dir),
        Commands::Apply {
            file,
            stack,
            params,
            concurrency,
            timeout_secs,
            dry_run,
            force,
            state_dir,
        } => {
            cmd_apply(
                &file,
                stack.as_deref(),
                &params,
                &state_dir,
                concurrency,
                timeout_secs,
                dry_run,
                force,
            )
            .await
        }
        Commands::Destroy {
            file,
            stack,
            timeout_secs,
            state_dir,
        } => cmd_destroy(&file, stack.as_deref(), timeout_secs, &state_dir).await,
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
    }
}

/// Stack name: explicit flag, else the document file stem.
fn stack_name(file: &Path, stack: Option<&str>) -> Result<String, CliError> {
    if let Some(name) = stack {
        return Ok(name.to_string());
    }
    file.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| CliError::Usage(format!("cannot derive stack name from {}", file.display())))
}

fn overrides_map(params: &[(String, String)]) -> IndexMap<String, String> {
    params.iter().cloned().collect()
}

fn cmd_init(path: &Path) -> Result<(), CliError> {
    let doc_path = path.join("stack.yaml");
    if doc_path.exists() {
        return Err(CliError::Usage(format!(
            "{} already exists",
            doc_path.display()
        )));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| CliError::Usage(format!("cannot create state dir: {e}")))?;

    let template = r#"format_version: "1.0"
description: "Managed stack"

parameters: {}

mappings: {}

resources: {}

outputs: {}
"#;
    std::fs::write(&doc_path, template)
        .map_err(|e| CliError::Usage(format!("cannot write {}: {e}", doc_path.display())))?;

    println!("Initialized stack project at {}", path.display());
    println!("  Created: {}", doc_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), CliError> {
    let template = parser::parse_template_file(file)?;
    let errors = parser::validate_template(&template);

    if errors.is_empty() {
        println!(
            "OK: {} parameter(s), {} resource(s), {} output(s)",
            template.parameters.len(),
            template.resources.len(),
            template.outputs.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {e}");
        }
        Err(CliError::Validation(errors.len()))
    }
}

/// Parse and validate a stack document, reporting every finding on stderr.
fn parse_and_validate(file: &Path) -> Result<StackTemplate, CliError> {
    let template = parser::parse_template_file(file)?;
    let errors = parser::validate_template(&template);
    if errors.is_empty() {
        return Ok(template);
    }
    for e in &errors {
        eprintln!("  ERROR: {e}");
    }
    Err(CliError::Validation(errors.len()))
}

fn cmd_plan(
    file: &Path,
    stack: Option<&str>,
    params: &[(String, String)],
    state_dir: &Path,
) -> Result<(), CliError> {
    let template = parse_and_validate(file)?;
    let stack = stack_name(file, stack)?;
    // Overrides are validated the same way apply validates them
    let overrides = overrides_map(params);
    crate::core::eval::ResolutionContext::new(&template, &overrides).map_err(|source| {
        CliError::Engine(EngineError::Resolution {
            id: "parameters".to_string(),
            source,
        })
    })?;

    let order = graph::creation_order(&template.resources)
        .map_err(|e| CliError::Engine(EngineError::Graph(e)))?;
    let prior = state::load_state(state_dir, &stack)
        .map_err(|e| CliError::Engine(EngineError::State(e)))?;
    let stack_plan = plan::plan(&stack, &template, &order, prior.as_ref());

    print_plan(&stack_plan);
    Ok(())
}

fn print_plan(stack_plan: &StackPlan) {
    println!(
        "Planning: {} ({} resources)",
        stack_plan.stack,
        stack_plan.changes.len()
    );
    println!();

    for change in &stack_plan.changes {
        let symbol = match change.action {
            PlanAction::Create => "+",
            PlanAction::Update => "~",
            PlanAction::Destroy => "-",
            PlanAction::NoOp => " ",
        };
        println!("  {} {}", symbol, change.description);
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} unchanged.",
        stack_plan.to_create, stack_plan.to_update, stack_plan.unchanged
    );
}

#[allow(clippy::too_many_arguments)]
async fn cmd_apply(
    file: &Path,
    stack: Option<&str>,
    params: &[(String, String)],
    state_dir: &Path,
    concurrency: usize,
    timeout_secs: u64,
    dry_run: bool,
    force: bool,
) -> Result<(), CliError> {
    let template = parse_and_validate(file)?;
    let stack = stack_name(file, stack)?;
    let overrides = overrides_map(params);

    let mut opts = ApplyOptions::new(&stack, &template, &overrides, state_dir);
    opts.concurrency = concurrency;
    opts.call_timeout = Duration::from_secs(timeout_secs);
    opts.dry_run = dry_run;
    opts.force = force;

    let provider = Arc::new(LocalProvider::new(&state_dir.join(&stack)));
    let report = engine::apply(&opts, provider).await?;

    if dry_run {
        println!("Dry run — no changes applied.");
        for (id, outcome) in &report.outcomes {
            let marker = if outcome.unchanged { " " } else { "+" };
            println!("  {} {} [{}]", marker, id, outcome.resource_type);
        }
        return Ok(());
    }

    for (id, outcome) in &report.outcomes {
        let physical = outcome.physical_id.as_deref().unwrap_or("-");
        println!("  {}: {} {}", id, outcome.state, physical);
        if let Some(error) = &outcome.error {
            println!("      error: {error}");
        }
        if let Some(error) = &outcome.rollback_error {
            println!("      rollback error: {error}");
        }
    }

    println!();
    if report.has_rollback_failure() {
        let stuck = report
            .outcomes
            .values()
            .filter(|o| o.rollback_error.is_some())
            .count() as u32;
        return Err(CliError::Rollback(stuck));
    }
    if !report.is_success() {
        let failed = report.count(ResourceState::Failed)
            + report.count(ResourceState::RolledBack);
        println!("Apply failed: {failed} resource(s) failed or rolled back.");
        return Err(CliError::Provisioning(report.count(ResourceState::Failed)));
    }

    println!(
        "Apply complete: {} created, {} unchanged ({:.1}s).",
        report.created(),
        report.unchanged(),
        report.total_duration.as_secs_f64()
    );

    if !report.outputs.is_empty() {
        println!();
        println!("Outputs:");
        for (name, value) in &report.outputs {
            let rendered = crate::core::types::scalar_to_string(value)
                .unwrap_or_else(|| format!("{value:?}"));
            println!("  {name} = {rendered}");
        }
    }

    Ok(())
}

async fn cmd_destroy(
    file: &Path,
    stack: Option<&str>,
    timeout_secs: u64,
    state_dir: &Path,
) -> Result<(), CliError> {
    let stack = stack_name(file, stack)?;
    let opts = DestroyOptions {
        stack: &stack,
        state_dir,
        call_timeout: Duration::from_secs(timeout_secs),
    };
    let provider = Arc::new(LocalProvider::new(&state_dir.join(&stack)));
    let report = engine::destroy(&opts, provider).await?;

    println!("Destroyed {} resource(s).", report.deleted);
    if !report.failures.is_empty() {
        for (id, error) in &report.failures {
            eprintln!("  FAILED: {id}: {error}");
        }
        return Err(CliError::Provisioning(report.failures.len() as u32));
    }
    Ok(())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>) -> Result<(), CliError> {
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| CliError::Usage(format!("cannot read state dir {}: {e}", state_dir.display())))?;

    let mut found = false;

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(filter) = stack_filter {
            if name != filter {
                continue;
            }
        }
        if !entry.path().is_dir() {
            continue;
        }

        let loaded = state::load_state(state_dir, &name)
            .map_err(|e| CliError::Engine(EngineError::State(e)))?;
        if let Some(stack_state) = loaded {
            found = true;
            println!("Stack: {}", stack_state.stack);
            println!("  Generated: {}", stack_state.generated_at);
            println!("  Generator: {}", stack_state.generator);
            println!("  Resources: {}", stack_state.resources.len());

            for (id, record) in &stack_state.resources {
                let physical = record.physical_id.as_deref().unwrap_or("-");
                println!(
                    "    {}: {} [{}] {}",
                    id, record.status, record.resource_type, physical
                );
            }
            println!();
        }
    }

    if !found {
        println!("No state found. Run `armazon apply` first.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE_DOC: &str = r#"
format_version: "1.0"
parameters:
  env:
    default: dev
    allowed_values: [dev, prod]
resources:
  site_bucket:
    type: storage_bucket
    properties:
      bucket_name: { join: ["site-", { ref: env }] }
  cdn:
    type: cdn_distribution
    properties:
      origin: { get_attr: [site_bucket, bucket_name] }
outputs:
  origin:
    value: { get_attr: [cdn, origin] }
"#;

    fn write_doc(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("site.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("env=prod").unwrap(),
            ("env".to_string(), "prod".to_string())
        );
        assert!(parse_key_val("no-equals").is_err());
    }

    #[test]
    fn test_stack_name_from_file_stem() {
        assert_eq!(
            stack_name(Path::new("deploy/site.yaml"), None).unwrap(),
            "site"
        );
        assert_eq!(
            stack_name(Path::new("site.yaml"), Some("prod-site")).unwrap(),
            "prod-site"
        );
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        assert!(dir.path().join("stack.yaml").exists());
        assert!(dir.path().join("state").is_dir());
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_validate_valid_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), SITE_DOC);
        cmd_validate(&doc).unwrap();
    }

    #[test]
    fn test_validate_reports_errors_with_exit_code_2() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(
            dir.path(),
            r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
    depends_on: [ghost]
"#,
        );
        let err = cmd_validate(&doc).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_apply_then_plan_shows_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), SITE_DOC);
        let state_dir = dir.path().join("state");

        cmd_apply(&doc, None, &[], &state_dir, 4, 60, false, false)
            .await
            .unwrap();

        // Second run should be a no-op plan
        let template = parser::parse_template_file(&doc).unwrap();
        let order = graph::creation_order(&template.resources).unwrap();
        let prior = state::load_state(&state_dir, "site").unwrap();
        let p = plan::plan("site", &template, &order, prior.as_ref());
        assert_eq!(p.unchanged, 2);
        assert_eq!(p.to_create, 0);
    }

    #[tokio::test]
    async fn test_apply_dry_run_writes_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), SITE_DOC);
        let state_dir = dir.path().join("state");

        cmd_apply(&doc, None, &[], &state_dir, 4, 60, true, false)
            .await
            .unwrap();
        assert!(state::load_state(&state_dir, "site").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_rejects_bad_override_with_exit_code_2() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), SITE_DOC);
        let state_dir = dir.path().join("state");

        let params = vec![("env".to_string(), "staging".to_string())];
        let err = cmd_apply(&doc, None, &params, &state_dir, 4, 60, false, false)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_destroy_after_apply() {
        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), SITE_DOC);
        let state_dir = dir.path().join("state");

        cmd_apply(&doc, None, &[], &state_dir, 4, 60, false, false)
            .await
            .unwrap();
        cmd_destroy(&doc, None, 60, &state_dir).await.unwrap();

        let saved = state::load_state(&state_dir, "site").unwrap().unwrap();
        assert!(saved.resources.is_empty());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Validation(2).exit_code(), 2);
        assert_eq!(CliError::Provisioning(1).exit_code(), 3);
        assert_eq!(CliError::Rollback(1).exit_code(), 4);
        assert_eq!(CliError::Usage("x".into()).exit_code(), 1);
    }
}
