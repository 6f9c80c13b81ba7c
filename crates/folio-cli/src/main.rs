use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use folio_contracts::events::EventWriter;
use folio_contracts::runs::summary::{write_summary, BatchSummary};
use folio_contracts::{ProcessingState, Scene, SceneStatus};
use folio_engine::export::{interactive_document, standalone_document};
use folio_engine::generator::PromptTier;
use folio_engine::{
    build_backends, BatchOutcome, Credential, DocumentAssembler, ImageGenerator, ResumeOutcome,
    SceneGenerationController, SessionConfig,
};
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Illustrate a story with generated scene images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze a story, generate its illustrations and write the outputs.
    Illustrate(IllustrateArgs),
    /// Generate one scene again from a previous run's scenes.json.
    Regenerate(RegenerateArgs),
    /// Rebuild the documents from a story and a scenes.json, offline.
    Assemble(AssembleArgs),
    /// Show the prompt that would be sent for a visual description.
    Sanitize(SanitizeArgs),
}

#[derive(Debug, Clone, Args)]
struct ProviderArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    /// Seconds between image requests.
    #[arg(long)]
    spacing_s: Option<f64>,
    /// Never ask for a replacement key on stdin.
    #[arg(long)]
    no_prompt: bool,
}

#[derive(Debug, Parser)]
struct IllustrateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    title: Option<String>,
    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Debug, Parser)]
struct RegenerateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    scenes: PathBuf,
    #[arg(long)]
    scene: u32,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    title: Option<String>,
    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Debug, Parser)]
struct AssembleArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    scenes: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Parser)]
struct SanitizeArgs {
    #[arg(long)]
    prompt: String,
    /// raw, sanitized or ultra-safe
    #[arg(long, default_value = "sanitized")]
    tier: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("folio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Illustrate(args) => run_illustrate(args),
        Command::Regenerate(args) => run_regenerate(args),
        Command::Assemble(args) => run_assemble(args),
        Command::Sanitize(args) => run_sanitize(args),
    }
}

fn run_illustrate(args: IllustrateArgs) -> Result<i32> {
    let text = read_story(&args.input)?;
    let title = resolve_title(args.title.as_deref(), &text, &args.input);
    let config = load_config(&args.provider)?;
    let session = Session::start(&args.out, args.events.as_deref())?;
    let mut controller = session.controller(config)?;
    controller.set_document(text)?;

    let mut outcome = controller.start_batch(0)?;
    while let BatchOutcome::Paused { resume_index } = outcome {
        println!("Paused before scene index {resume_index}: API quota exhausted.");
        let Some(credential) = ask_for_credential(args.provider.no_prompt)? else {
            break;
        };
        controller.replace_credential(credential)?;
        outcome = match controller.resume()? {
            ResumeOutcome::Batch(next) => next,
            ResumeOutcome::Regenerated(_) | ResumeOutcome::NothingPending => break,
        };
    }

    let label = match outcome {
        BatchOutcome::Completed => "completed",
        BatchOutcome::Paused { .. } => "paused",
        BatchOutcome::Cancelled => "cancelled",
    };
    write_outputs(&args.out, &title, &controller, &session, label)?;
    Ok(match outcome {
        BatchOutcome::Completed => 0,
        BatchOutcome::Paused { .. } => 2,
        BatchOutcome::Cancelled => 1,
    })
}

fn run_regenerate(args: RegenerateArgs) -> Result<i32> {
    let text = read_story(&args.input)?;
    let title = resolve_title(args.title.as_deref(), &text, &args.input);
    let scenes = read_scenes(&args.scenes)?;
    let config = load_config(&args.provider)?;
    let session = Session::start(&args.out, args.events.as_deref())?;
    let mut controller = session.controller(config)?;
    controller.set_document(text)?;
    controller.load_scenes(scenes)?;

    let mut result = controller.regenerate_one(args.scene);
    let status = loop {
        match result {
            Ok(status) => break Some(status),
            Err(err) if err.is_quota() => {
                println!("Quota exhausted while regenerating scene {}.", args.scene);
                let Some(credential) = ask_for_credential(args.provider.no_prompt)? else {
                    break None;
                };
                controller.replace_credential(credential)?;
                result = match controller.resume() {
                    Ok(ResumeOutcome::Regenerated(status)) => Ok(status),
                    Ok(_) => break None,
                    Err(err) => Err(err),
                };
            }
            Err(err) => {
                return Err(err).with_context(|| format!("regenerating scene {}", args.scene))
            }
        }
    };

    let label = match status {
        Some(SceneStatus::Completed) => "completed",
        Some(_) => "failed",
        None => "paused",
    };
    write_outputs(&args.out, &title, &controller, &session, label)?;
    Ok(match status {
        Some(SceneStatus::Completed) => 0,
        Some(_) => 1,
        None => 2,
    })
}

fn run_assemble(args: AssembleArgs) -> Result<i32> {
    let text = read_story(&args.input)?;
    let title = resolve_title(args.title.as_deref(), &text, &args.input);
    let scenes = read_scenes(&args.scenes)?;
    let rendered = DocumentAssembler::default().assemble(&text, &scenes);
    write_documents(
        &args.out,
        &title,
        &rendered.markdown_with_images,
        &rendered.html_content,
        &rendered.clean_html_content,
    )?;
    println!("Assembled {} scene(s) into {}", scenes.len(), args.out.display());
    Ok(0)
}

fn run_sanitize(args: SanitizeArgs) -> Result<i32> {
    let tier = match args.tier.trim().to_ascii_lowercase().as_str() {
        "raw" => PromptTier::Raw,
        "sanitized" => PromptTier::Sanitized,
        "ultra-safe" | "ultra_safe" | "ultrasafe" => PromptTier::UltraSafe,
        other => bail!("unknown tier '{other}' (expected raw, sanitized or ultra-safe)"),
    };
    let generator = ImageGenerator::from_config(&SessionConfig::default());
    println!("{}", generator.prepare_prompt(&args.prompt, tier));
    Ok(0)
}

/// Per-invocation identity and journal.
struct Session {
    id: String,
    started_at: String,
    events: EventWriter,
}

impl Session {
    fn start(out: &Path, events: Option<&Path>) -> Result<Self> {
        fs::create_dir_all(out).with_context(|| format!("failed creating {}", out.display()))?;
        let id = uuid::Uuid::new_v4().to_string();
        let events_path = events
            .map(Path::to_path_buf)
            .unwrap_or_else(|| out.join("events.jsonl"));
        Ok(Self {
            events: EventWriter::new(events_path, id.clone()),
            id,
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn controller(&self, config: SessionConfig) -> Result<SceneGenerationController> {
        let backends = build_backends(&config)?;
        let controller =
            SceneGenerationController::new(config, backends).with_events(self.events.clone());
        attach_progress_printer(&controller);
        Ok(controller)
    }
}

fn attach_progress_printer(controller: &SceneGenerationController) {
    let last = Arc::new(Mutex::new(String::new()));
    controller.board().subscribe(move |state: &ProcessingState, _scenes: &[Scene]| {
        let line = format!("[{}] {}", stage_label(state), state.progress_message);
        let Ok(mut previous) = last.lock() else {
            return;
        };
        if state.progress_message.is_empty() || *previous == line {
            return;
        }
        println!("{line}");
        *previous = line;
    });
}

fn stage_label(state: &ProcessingState) -> String {
    let stage = serde_json::to_value(state.stage)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    if state.total_scenes == 0 {
        return stage;
    }
    format!("{stage} {}/{}", state.completed_scenes, state.total_scenes)
}

fn load_config(args: &ProviderArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    config.apply_env();
    apply_overrides(&mut config, args);
    config.validate().context("invalid session settings")?;
    Ok(config)
}

fn apply_overrides(config: &mut SessionConfig, args: &ProviderArgs) {
    if let Some(provider) = non_empty(args.provider.as_deref()) {
        config.provider = provider.to_ascii_lowercase();
    }
    if let Some(key) = non_empty(args.api_key.as_deref()) {
        config.credential = Credential::new(key);
    }
    if let Some(base) = non_empty(args.api_base.as_deref()) {
        config.api_base = Some(base.to_string());
    }
    if let Some(model) = non_empty(args.text_model.as_deref()) {
        config.text_model = Some(model.to_string());
    }
    if let Some(model) = non_empty(args.image_model.as_deref()) {
        config.image_model = Some(model.to_string());
    }
    if let Some(spacing) = args.spacing_s {
        config.pacing.request_spacing_s = spacing.max(0.0);
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Reads a replacement key from stdin. `None` means stop.
fn ask_for_credential(no_prompt: bool) -> Result<Option<Credential>> {
    let stdin = io::stdin();
    if no_prompt || !stdin.is_terminal() {
        return Ok(None);
    }
    print!("New API key (leave empty to stop): ");
    io::stdout().flush()?;
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    let credential = Credential::new(line);
    Ok((!credential.is_empty()).then_some(credential))
}

fn read_story(path: &Path) -> Result<String> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    if text.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(text)
}

fn read_scenes(path: &Path) -> Result<Vec<Scene>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid scenes file {}", path.display()))
}

/// First Markdown heading, else the file stem.
fn resolve_title(explicit: Option<&str>, text: &str, input: &Path) -> String {
    if let Some(title) = non_empty(explicit) {
        return title.to_string();
    }
    text.lines()
        .map(str::trim)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
        .or_else(|| {
            input
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Untitled story".to_string())
}

fn write_outputs(
    out: &Path,
    title: &str,
    controller: &SceneGenerationController,
    session: &Session,
    outcome: &str,
) -> Result<()> {
    let scenes = controller.board().scenes();
    write_json_value(&out.join("scenes.json"), &serde_json::to_value(&scenes)?)?;
    let rendered = controller.assemble_document();
    write_documents(
        out,
        title,
        &rendered.markdown_with_images,
        &rendered.html_content,
        &rendered.clean_html_content,
    )?;

    let summary = BatchSummary::from_scenes(session.id.clone(), session.started_at.clone(), &scenes);
    let mut extra = Map::new();
    extra.insert("outcome".to_string(), Value::String(outcome.to_string()));
    extra.insert(
        "provider".to_string(),
        Value::String(controller.config().provider.clone()),
    );
    extra.insert("title".to_string(), Value::String(title.to_string()));
    write_summary(&out.join("summary.json"), &summary, Some(&extra))?;
    println!(
        "{} of {} illustration(s) ready, {} failed. Outputs in {}",
        summary.completed_scenes,
        summary.total_scenes,
        summary.failed_scenes,
        out.display()
    );
    Ok(())
}

fn write_documents(
    out: &Path,
    title: &str,
    markdown: &str,
    html: &str,
    clean_html: &str,
) -> Result<()> {
    fs::create_dir_all(out).with_context(|| format!("failed creating {}", out.display()))?;
    let files = [
        ("rendered.md", markdown.to_string()),
        ("interactive.html", interactive_document(title, html)),
        ("illustrated.html", standalone_document(title, clean_html)),
    ];
    for (name, body) in files {
        let path = out.join(name);
        fs::write(&path, body).with_context(|| format!("failed writing {}", path.display()))?;
    }
    Ok(())
}

fn write_json_value(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_string_pretty(value)?;
    fs::write(path, encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use clap::Parser;
    use folio_contracts::SceneStatus;
    use serde_json::Value;

    use super::*;

    const STORY: &str = "# Harbour Lights\n\nMei lit the first lantern as the tide came in.\n\nThe boats drifted home under a copper sky.\n\nAt dawn the harbour was silver and still.\n";

    fn dryrun_args(no_prompt: bool) -> ProviderArgs {
        ProviderArgs {
            config: None,
            provider: Some("dryrun".to_string()),
            api_key: None,
            api_base: None,
            text_model: None,
            image_model: None,
            spacing_s: Some(0.0),
            no_prompt,
        }
    }

    #[test]
    fn cli_parses_illustrate_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "folio",
            "illustrate",
            "--input",
            "story.md",
            "--out",
            "out",
            "--provider",
            "chat",
            "--spacing-s",
            "2.5",
        ])?;
        match cli.command {
            Command::Illustrate(args) => {
                assert_eq!(args.provider.provider.as_deref(), Some("chat"));
                assert_eq!(args.provider.spacing_s, Some(2.5));
                assert!(!args.provider.no_prompt);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn overrides_win_over_file_and_env() {
        let mut config = SessionConfig::default();
        let mut args = dryrun_args(true);
        args.api_key = Some("  cli-key ".to_string());
        args.image_model = Some("custom-image".to_string());
        apply_overrides(&mut config, &args);
        assert_eq!(config.provider, "dryrun");
        assert_eq!(config.credential.expose(), "cli-key");
        assert_eq!(config.image_model.as_deref(), Some("custom-image"));
        assert_eq!(config.pacing.request_spacing_s, 0.0);
    }

    #[test]
    fn unbounded_spacing_flag_is_refused() {
        let mut args = dryrun_args(true);
        args.spacing_s = Some(f64::INFINITY);
        let err = match load_config(&args) {
            Err(err) => format!("{err:#}"),
            Ok(config) => panic!("accepted spacing {}", config.pacing.request_spacing_s),
        };
        assert!(err.contains("request_spacing_s"), "{err}");
    }

    #[test]
    fn title_prefers_flag_then_heading_then_stem() {
        let path = Path::new("stories/harbour.md");
        assert_eq!(resolve_title(Some("Given"), STORY, path), "Given");
        assert_eq!(resolve_title(None, STORY, path), "Harbour Lights");
        assert_eq!(resolve_title(Some("  "), "no heading", path), "harbour");
    }

    #[test]
    fn dryrun_illustrate_writes_every_output() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("story.md");
        fs::write(&input, STORY)?;
        let out = temp.path().join("out");
        let code = run_illustrate(IllustrateArgs {
            input: input.clone(),
            out: out.clone(),
            events: None,
            title: None,
            provider: dryrun_args(true),
        })?;
        assert_eq!(code, 0);
        for name in [
            "scenes.json",
            "rendered.md",
            "interactive.html",
            "illustrated.html",
            "summary.json",
            "events.jsonl",
        ] {
            assert!(out.join(name).exists(), "missing {name}");
        }
        let scenes = read_scenes(&out.join("scenes.json"))?;
        assert_eq!(scenes.len(), 4);
        assert!(scenes.iter().all(|scene| scene.status == SceneStatus::Completed));

        let summary: Value = serde_json::from_str(&fs::read_to_string(out.join("summary.json"))?)?;
        assert_eq!(summary.get("outcome").and_then(Value::as_str), Some("completed"));
        assert_eq!(summary.get("completed_scenes").and_then(Value::as_u64), Some(4));

        let clean = fs::read_to_string(out.join("illustrated.html"))?;
        assert_eq!(clean.matches("<img").count(), 4);
        assert!(clean.contains("<title>Harbour Lights</title>"));

        let code = run_assemble(AssembleArgs {
            input,
            scenes: out.join("scenes.json"),
            out: temp.path().join("again"),
            title: Some("Again".to_string()),
        })?;
        assert_eq!(code, 0);
        let rebuilt = fs::read_to_string(temp.path().join("again").join("illustrated.html"))?;
        assert_eq!(rebuilt.matches("<img").count(), 4);
        Ok(())
    }

    #[test]
    fn dryrun_regenerate_updates_one_scene() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("story.md");
        fs::write(&input, STORY)?;
        let out = temp.path().join("out");
        run_illustrate(IllustrateArgs {
            input: input.clone(),
            out: out.clone(),
            events: None,
            title: None,
            provider: dryrun_args(true),
        })?;
        let code = run_regenerate(RegenerateArgs {
            input,
            scenes: out.join("scenes.json"),
            scene: 2,
            out: out.clone(),
            events: None,
            title: None,
            provider: dryrun_args(true),
        })?;
        assert_eq!(code, 0);
        let types = folio_contracts::events::read_event_types(&out.join("events.jsonl"))?;
        assert_eq!(types.last().map(String::as_str), Some("scene_completed"));
        Ok(())
    }

    #[test]
    fn unknown_sanitize_tier_is_rejected() {
        let result = run_sanitize(SanitizeArgs {
            prompt: "a knife".to_string(),
            tier: "loose".to_string(),
        });
        assert!(result.is_err());
    }
}
