use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use etherscape_contracts::chat::{
    apply_function_call, parse_intent, ChatAction, ChatControls, CHAT_HELP_COMMANDS,
};
use etherscape_contracts::events::EventWriter;
use etherscape_contracts::history::{
    HistoryItem, HistoryRecorder, JsonHistoryStore, DEFAULT_HISTORY_CAPACITY,
};
use etherscape_contracts::providers::{DRYRUN, FAL, GEMINI, LEONARDO};
use etherscape_contracts::settings::{BaseImage, GenerationSettings};
use etherscape_engine::config::EngineEnv;
use etherscape_engine::discovery::refresh_leonardo_catalog;
use etherscape_engine::dispatch::{PollPolicy, ProviderDispatch};
use etherscape_engine::media::decode_data_url;
use etherscape_engine::notify::{EventNotifier, FanoutNotifier, StderrNotifier};
use etherscape_engine::orchestrator::{
    Collaborators, Orchestrator, OrchestratorConfig, StepOutcome,
};
use etherscape_engine::realtime::RealtimeChannel;
use etherscape_engine::runner::{command_channel, realtime_sink, OrchestratorRunner, RunnerHandle};
use etherscape_engine::theme::{DryrunThemeGenerator, GeminiThemeGenerator, ThemeGenerator};
use etherscape_engine::upload::{CloudUploader, DriveUploader};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "etherscape-rs", version, about = "Etherscape multi-provider image engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One image, no evolution.
    Generate(SessionArgs),
    /// Run the evolution loop for a number of completed images.
    Evolve(EvolveArgs),
    /// Interactive slash-command session.
    Chat(SessionArgs),
    History(HistoryArgs),
    Catalog(CatalogArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// JSON file holding a full `GenerationSettings` value.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    concept: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    aspect: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    seed: Option<i64>,
    /// Used verbatim instead of generating a prompt from the concept.
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    base_image: Option<String>,
    #[arg(long, default_value_t = 0.6)]
    strength: f64,
    #[arg(long)]
    grounding: bool,
    #[arg(long)]
    drive: bool,
    #[arg(long)]
    dryrun_theme: bool,
}

#[derive(Debug, Args)]
struct EvolveArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, default_value_t = 3)]
    cycles: usize,
    #[arg(long)]
    delay_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    out: PathBuf,
    #[command(subcommand)]
    action: HistoryAction,
}

#[derive(Debug, Subcommand)]
enum HistoryAction {
    List,
    Delete { id: String },
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    refresh_leonardo: bool,
}

const REALTIME_WAIT: Duration = Duration::from_secs(120);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("etherscape-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Evolve(args) => run_evolve(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::History(args) => run_history(args),
        Command::Catalog(args) => run_catalog(args),
    }
}

struct Session {
    handle: RunnerHandle,
    outcomes: Receiver<StepOutcome>,
    settings: GenerationSettings,
    out: PathBuf,
}

fn load_settings(args: &SessionArgs, env: &EngineEnv) -> Result<GenerationSettings> {
    let mut settings = match args.settings.as_ref() {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings {}", path.display()))?;
            serde_json::from_str::<GenerationSettings>(&raw)
                .with_context(|| format!("invalid settings {}", path.display()))?
        }
        None => GenerationSettings::new("Cosmic jellyfish ballet", "Impressionistic", DRYRUN, "dryrun-image-1"),
    };
    if let Some(concept) = args.concept.as_ref() {
        settings.concept = concept.clone();
    }
    if let Some(style) = args.style.as_ref() {
        settings.art_style = style.clone();
    }
    if let Some(aspect) = args.aspect.as_ref() {
        settings.aspect_ratio = aspect.clone();
    }
    if let Some(provider) = args.provider.as_ref() {
        settings.selected_provider = provider.clone();
        settings.selected_model = args.model.clone().unwrap_or_default();
    } else if let Some(model) = args.model.as_ref() {
        settings.selected_model = model.clone();
    }
    if let Some(negative) = args.negative.as_ref() {
        settings.negative_prompt = Some(negative.clone());
    }
    if let Some(seed) = args.seed {
        settings.params.seed = Some(seed);
    }
    if let Some(prompt) = args.prompt.as_ref() {
        settings.prompt_override = Some(prompt.clone());
    }
    if let Some(url) = args.base_image.as_ref() {
        settings.base_image = Some(BaseImage {
            url: url.clone(),
            strength: args.strength.clamp(0.0, 1.0),
        });
    }
    settings.use_search_grounding |= args.grounding;
    settings.drive.enabled |= args.drive;
    settings.drive.authenticated = env.drive_access_token.is_some();
    env.merge_api_keys(&mut settings.api_keys);
    if settings.concept.trim().is_empty() {
        bail!("a concept is required (--concept or settings file)");
    }
    Ok(settings)
}

fn build_theme(args: &SessionArgs, settings: &GenerationSettings, env: &EngineEnv) -> Result<Box<dyn ThemeGenerator>> {
    if args.dryrun_theme || settings.selected_provider == DRYRUN {
        return Ok(Box::new(DryrunThemeGenerator));
    }
    let Some(key) = settings.api_key(GEMINI) else {
        bail!("Gemini API key is required for theme generation (set GEMINI_API_KEY or pass --dryrun-theme)");
    };
    Ok(Box::new(GeminiThemeGenerator::new(env.api_base(GEMINI), key)))
}

fn start_session(args: &SessionArgs, evolution_delay: Option<Duration>) -> Result<Session> {
    let env = EngineEnv::from_env();
    let settings = load_settings(args, &env)?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(events_path, uuid::Uuid::new_v4().to_string());
    let history = JsonHistoryStore::open(args.out.join("history.json"), DEFAULT_HISTORY_CAPACITY)?;

    let uploader = env.drive_access_token.as_ref().map(|token| {
        Box::new(DriveUploader::new(
            env.drive_api_base.clone(),
            token.clone(),
            env.drive_folder_id.clone(),
        )) as Box<dyn CloudUploader>
    });

    let (tx, rx) = command_channel();
    let collaborators = Collaborators {
        theme: build_theme(args, &settings, &env)?,
        dispatcher: Box::new(ProviderDispatch::from_env(&env, PollPolicy::default())),
        realtime: Box::new(RealtimeChannel::new(env.api_base(FAL), realtime_sink(tx.clone()))),
        history: Box::new(history),
        uploader,
        notifier: Box::new(
            FanoutNotifier::new()
                .with(EventNotifier::new(events))
                .with(StderrNotifier {
                    quiet_progress: true,
                }),
        ),
    };
    let mut config = OrchestratorConfig::default();
    if let Some(delay) = evolution_delay {
        config.evolution_delay = delay;
    }
    let (outcomes_tx, outcomes) = mpsc::channel();
    let handle = OrchestratorRunner::spawn_with(
        Orchestrator::new(config, collaborators),
        tx,
        rx,
        outcomes_tx,
    )?;
    Ok(Session {
        handle,
        outcomes,
        settings,
        out: args.out.clone(),
    })
}

/// Waits past realtime hand-offs until a step completes or fails.
fn next_terminal_outcome(outcomes: &Receiver<StepOutcome>) -> Result<Option<StepOutcome>> {
    loop {
        let outcome = match outcomes.recv_timeout(REALTIME_WAIT) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => bail!("timed out waiting for a generation result"),
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
        };
        match outcome {
            StepOutcome::AwaitingRealtime { generation_id, provider } => {
                println!("Streaming generation {generation_id} from {provider}...");
            }
            StepOutcome::Skipped => {}
            other => return Ok(Some(other)),
        }
    }
}

fn run_generate(args: SessionArgs) -> Result<i32> {
    let session = start_session(&args, None)?;
    session.handle.generate_once(session.settings.clone())?;
    let code = match next_terminal_outcome(&session.outcomes)? {
        Some(StepOutcome::Completed(item)) => {
            report_item(&session.out, &item)?;
            0
        }
        Some(StepOutcome::Failed(failure)) => {
            eprintln!("Generation failed ({}): {}", failure.kind.as_str(), failure.message);
            1
        }
        _ => 1,
    };
    session.handle.shutdown()?;
    Ok(code)
}

fn run_evolve(args: EvolveArgs) -> Result<i32> {
    let session = start_session(&args.session, args.delay_secs.map(Duration::from_secs))?;
    session.handle.start(session.settings.clone())?;
    let mut completed = 0usize;
    let mut code = 0;
    while completed < args.cycles.max(1) {
        match next_terminal_outcome(&session.outcomes)? {
            Some(StepOutcome::Completed(item)) => {
                completed += 1;
                report_item(&session.out, &item)?;
            }
            Some(StepOutcome::Failed(failure)) => {
                eprintln!("Evolution stopped ({}): {}", failure.kind.as_str(), failure.message);
                code = 1;
                break;
            }
            _ => break,
        }
    }
    session.handle.stop()?;
    session.handle.shutdown()?;
    Ok(code)
}

fn run_chat(args: SessionArgs) -> Result<()> {
    let Session {
        handle,
        outcomes,
        settings,
        out,
    } = start_session(&args, None)?;
    let printer = thread::spawn(move || {
        while let Ok(outcome) = outcomes.recv() {
            match outcome {
                StepOutcome::Completed(item) => {
                    if let Err(err) = report_item(&out, &item) {
                        eprintln!("etherscape-rs warning: {err:#}");
                    }
                }
                StepOutcome::Failed(failure) => println!("Generation failed: {}", failure.message),
                StepOutcome::AwaitingRealtime { generation_id, .. } => {
                    println!("Streaming generation {generation_id}...")
                }
                StepOutcome::Skipped => {}
            }
        }
    });

    let mut controls = ChatControls::from_settings(&settings);
    let mut rng = rand::thread_rng();
    let stdin = io::stdin();
    let mut line = String::new();
    println!("Etherscape chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => continue,
            "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
            "start_evolution" => {
                handle.start(controls.apply_to(&settings))?;
                println!("Evolution started with \"{}\".", controls.concept);
            }
            "stop_evolution" => {
                handle.stop()?;
                println!("Evolution stopped.");
            }
            "unknown" => println!("Unknown command: {}", intent.raw.trim()),
            _ => {
                let Some(call) = intent.function_call() else {
                    println!("Unsupported action: {}", intent.action);
                    continue;
                };
                let outcome = apply_function_call(&mut controls, &call, &mut rng);
                println!("{}", outcome.message);
                if outcome.success && outcome.action == Some(ChatAction::GenerateNow) {
                    handle.generate_once(controls.apply_to(&settings))?;
                }
            }
        }
    }

    handle.shutdown()?;
    let _ = printer.join();
    Ok(())
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let mut store = JsonHistoryStore::open(args.out.join("history.json"), DEFAULT_HISTORY_CAPACITY)?;
    match args.action {
        HistoryAction::List => {
            for item in store.items() {
                println!(
                    "{}",
                    serde_json::to_string(&json!({
                        "id": item.id,
                        "created_at": item.created_at,
                        "concept": item.concept,
                        "provider": item.provider_id,
                        "model": item.model_id,
                        "size": item.dimensions().size_label(),
                        "derived_from": item.derived_from,
                        "drive_file_id": item.drive_file_id,
                    }))?
                );
            }
            Ok(0)
        }
        HistoryAction::Delete { id } => {
            if store.delete(&id)? {
                println!("Deleted {id}");
                Ok(0)
            } else {
                eprintln!("No history item {id}");
                Ok(1)
            }
        }
    }
}

fn run_catalog(args: CatalogArgs) -> Result<i32> {
    let env = EngineEnv::from_env();
    let mut settings = match args.settings.as_ref() {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings {}", path.display()))?;
            serde_json::from_str::<GenerationSettings>(&raw)
                .with_context(|| format!("invalid settings {}", path.display()))?
        }
        None => GenerationSettings::default(),
    };
    env.merge_api_keys(&mut settings.api_keys);

    if args.refresh_leonardo {
        let Some(key) = settings.api_key(LEONARDO).map(str::to_string) else {
            bail!("LEONARDO_API_KEY is required to refresh the Leonardo catalog");
        };
        let count = refresh_leonardo_catalog(
            &mut settings.catalog,
            &HttpClient::new(),
            &env.api_base(LEONARDO),
            &key,
        )?;
        eprintln!("Leonardo catalog refreshed: {count} models");
    }

    for provider in settings.catalog.list() {
        let has_key = !provider.requires_api_key || settings.api_key(&provider.id).is_some();
        for model in &provider.models {
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "provider": provider.id,
                    "model": model.id,
                    "name": model.name,
                    "role": model.role,
                    "base_dimension": model.base_dimension,
                    "image_to_image": model.supports_image_to_image,
                    "realtime": provider.realtime,
                    "ready": has_key,
                }))?
            );
        }
    }
    Ok(0)
}

fn report_item(out: &Path, item: &HistoryItem) -> Result<()> {
    match save_artifact(out, item)? {
        Some(path) => println!("{} -> {}", item.id, path.display()),
        None => println!("{} -> {}", item.id, item.media_url),
    }
    Ok(())
}

/// Writes `data:` results next to the history file; remote URLs are left as is.
fn save_artifact(out: &Path, item: &HistoryItem) -> Result<Option<PathBuf>> {
    let Some(image) = decode_data_url(&item.media_url) else {
        return Ok(None);
    };
    let dir = out.join("artifacts");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", item.id, image.extension()));
    fs::write(&path, &image.bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}
