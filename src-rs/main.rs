use alt_text_studio::classify::{CommandLoader, ModelSlot, PredictionsFileLoader};
use alt_text_studio::intake::{self, IntakeError, UploadFile, INVALID_TYPE_ALERT};
use alt_text_studio::session::{Session, SessionEvent};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CLASSIFIER_CMD_ENV: &str = "ALT_TEXT_CLASSIFIER_CMD";
const PREDICTIONS_ENV: &str = "ALT_TEXT_PREDICTIONS";
const TIMEOUT_ENV: &str = "ALT_TEXT_CLASSIFIER_TIMEOUT_SEC";
const DEFAULT_TIMEOUT_SEC: u64 = 60;

const SESSION_HELP: &str = r##"Session events (one per line):
  upload <path> [media-type]  upload an image; type detected from the extension
                              unless a trailing media type such as image/png is given
  upload-as <mime> <path>     same, with the media type first
  keywords <text>             set comma-separated keywords
  description <text>          set the product description
  generate                    print alt-text candidates
  reset                       clear keywords, description, image and results
  poll                        report whether the vision model has loaded
  wait                        block until the vision model has loaded
  state                       print the session state as JSON
  help                        print this help
  quit                        end the session
"##;

#[derive(Parser, Debug)]
#[command(
    name = "alt-text-studio",
    version,
    about = "Generate accessibility alt-text candidates for product images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::enum_variant_names)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Validate and classify one image, printing its visual attributes
    Classify(ClassifyArgs),
    /// Run the full pipeline and print alt-text candidates
    Generate(GenerateArgs),
    /// Interactive session driven by events on stdin
    Session(SessionArgs),
}

#[derive(Args, Debug, Clone)]
struct ClassifierArgs {
    /// External classifier command (reads image bytes on stdin, prints predictions JSON).
    /// Split on whitespace without shell quoting; wrap paths with spaces in a script
    #[arg(long)]
    classifier_cmd: Option<String>,
    /// JSON file of fixed predictions used for every image
    #[arg(long)]
    predictions: Option<PathBuf>,
    /// Per-image timeout for the external classifier
    #[arg(long)]
    timeout_sec: Option<u64>,
    /// How long to wait for the vision model to load before uploading
    #[arg(long, default_value_t = 30)]
    model_wait_sec: u64,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Image path (JPG, PNG or WebP)
    image: PathBuf,
    /// Declared media type (default: detected from the extension)
    #[arg(long)]
    media_type: Option<String>,
    #[command(flatten)]
    classifier: ClassifierArgs,
    /// Print JSON payload instead of one label per line
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Comma-separated keywords
    #[arg(long, default_value = "")]
    keywords: String,
    /// Product description
    #[arg(long, default_value = "")]
    description: String,
    /// Optional product image
    #[arg(long)]
    image: Option<PathBuf>,
    /// Declared media type of --image (default: detected from the extension)
    #[arg(long)]
    media_type: Option<String>,
    /// Write a PNG thumbnail of the accepted image
    #[arg(long)]
    preview_out: Option<PathBuf>,
    #[command(flatten)]
    classifier: ClassifierArgs,
    /// Print JSON payload instead of one candidate per line
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct SessionArgs {
    #[command(flatten)]
    classifier: ClassifierArgs,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Classify(args) => command_classify(args),
        Commands::Generate(args) => command_generate(args),
        Commands::Session(args) => command_session(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "classify",
            "description": "Validate an image and extract visual attributes with the vision model.",
        }),
        json!({
            "name": "generate",
            "description": "Compose alt-text candidates from keywords, description and image attributes.",
        }),
        json!({
            "name": "session",
            "description": "Event-driven session on stdin (upload/keywords/description/generate/reset).",
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_classify(args: ClassifyArgs) -> Result<()> {
    let mut session = open_session(&args.classifier);
    upload_path(&mut session, &args.image, args.media_type.as_deref())?;

    if args.json {
        let snap = session.snapshot();
        println!(
            "{}",
            serde_json::to_string(&json!({
                "image_path": abs_path(&args.image).display().to_string(),
                "classified_at": timestamp_iso(),
                "phase": snap.phase,
                "model": snap.model,
                "preview": snap.preview,
                "attributes": snap.attributes,
            }))?
        );
    } else {
        for label in session.attributes() {
            println!("{label}");
        }
    }
    Ok(())
}

fn command_generate(args: GenerateArgs) -> Result<()> {
    let mut session = open_session(&args.classifier);
    if let Some(image) = &args.image {
        upload_path(&mut session, image, args.media_type.as_deref())?;
        if let (Some(out), Some(accepted)) = (&args.preview_out, session.image()) {
            intake::write_preview(accepted, out)?;
        }
    } else if args.preview_out.is_some() {
        bail!("--preview-out requires --image");
    }

    session.set_keywords(args.keywords);
    session.set_description(args.description);
    session.generate();

    if args.json {
        let snap = session.snapshot();
        let payload = json!({
            "generated_at": timestamp_iso(),
            "image_path": args.image.as_deref().map(|p| abs_path(p).display().to_string()),
            "preview_path": args.preview_out.as_deref().map(|p| abs_path(p).display().to_string()),
            "phase": snap.phase,
            "attributes": snap.attributes,
            "candidates": snap.candidates,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for candidate in session.candidates() {
            println!("{candidate}");
        }
    }
    Ok(())
}

fn command_session(args: SessionArgs) -> Result<()> {
    let mut session = Session::new(model_slot(&args.classifier));
    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    run_session(
        &mut session,
        stdin.lock(),
        &mut stdout.lock(),
        &mut stderr.lock(),
        Duration::from_secs(args.classifier.model_wait_sec),
    )
}

#[derive(Debug)]
enum SessionLine {
    Event(SessionEvent),
    State,
    Wait,
    Help,
    Quit,
}

fn parse_session_line(line: &str) -> Result<Option<SessionLine>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.trim_start().starts_with('#') {
        return Ok(None);
    }
    let line = line.trim_start();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line.trim_end(), ""),
    };

    let parsed = match verb {
        "upload" => {
            if rest.is_empty() {
                bail!("usage: upload <path> [media-type]");
            }
            let (path, mime) = split_declared_type(rest);
            SessionLine::Event(SessionEvent::Upload(read_upload(Path::new(path), mime)?))
        }
        "upload-as" => {
            let Some((mime, path)) = rest.split_once(char::is_whitespace) else {
                bail!("usage: upload-as <mime> <path>");
            };
            SessionLine::Event(SessionEvent::Upload(read_upload(
                Path::new(path.trim()),
                Some(mime),
            )?))
        }
        "keywords" => SessionLine::Event(SessionEvent::SetKeywords(rest.to_string())),
        "description" => SessionLine::Event(SessionEvent::SetDescription(rest.to_string())),
        "generate" => SessionLine::Event(SessionEvent::Generate),
        "reset" | "refresh" => SessionLine::Event(SessionEvent::Reset),
        "state" => SessionLine::State,
        "poll" => SessionLine::Event(SessionEvent::ModelPoll),
        "wait" => SessionLine::Wait,
        "help" => SessionLine::Help,
        "quit" | "exit" => SessionLine::Quit,
        other => bail!("unknown event `{other}` (try `help`)"),
    };
    Ok(Some(parsed))
}

/// Process session events in arrival order, one at a time.
fn run_session<R: BufRead, W: Write, E: Write>(
    session: &mut Session,
    input: R,
    out: &mut W,
    err: &mut E,
    model_wait: Duration,
) -> Result<()> {
    for line in input.lines() {
        let line = line.context("failed to read session input")?;
        let parsed = match parse_session_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                writeln!(err, "error: {e:#}")?;
                continue;
            }
        };

        match parsed {
            SessionLine::Event(event) => {
                let report = match &event {
                    SessionEvent::Upload(_) => Some(Report::Attributes),
                    SessionEvent::Generate => Some(Report::Candidates),
                    SessionEvent::ModelPoll => Some(Report::Model),
                    _ => None,
                };
                match session.handle(event) {
                    Ok(()) => match report {
                        Some(Report::Attributes) => {
                            writeln!(out, "attributes: {}", session.attributes().join(", "))?
                        }
                        Some(Report::Candidates) => {
                            for candidate in session.candidates() {
                                writeln!(out, "{candidate}")?;
                            }
                        }
                        Some(Report::Model) => writeln!(
                            out,
                            "model: {}",
                            serde_json::to_string(&session.snapshot().model)?
                        )?,
                        None => {}
                    },
                    Err(e) => writeln!(err, "{}", alert_text(&e))?,
                }
            }
            SessionLine::State => {
                writeln!(out, "{}", serde_json::to_string(&session.snapshot())?)?;
            }
            SessionLine::Wait => {
                let ready = session.wait_for_model(model_wait);
                writeln!(out, "model: {}", if ready { "ready" } else { "unavailable" })?;
            }
            SessionLine::Help => write!(out, "{SESSION_HELP}")?,
            SessionLine::Quit => break,
        }
        out.flush()?;
    }
    Ok(())
}

enum Report {
    Attributes,
    Candidates,
    Model,
}

/// Split `<path> [media-type]`. The last token is taken as a media type only
/// when another token precedes it and it looks like `image/png`.
fn split_declared_type(rest: &str) -> (&str, Option<&str>) {
    if let Some((path, last)) = rest.rsplit_once(char::is_whitespace) {
        if looks_like_media_type(last) && !path.trim().is_empty() {
            return (path.trim_end(), Some(last));
        }
    }
    (rest, None)
}

fn looks_like_media_type(token: &str) -> bool {
    let Some((kind, subtype)) = token.split_once('/') else {
        return false;
    };
    matches!(
        kind.to_ascii_lowercase().as_str(),
        "image" | "application" | "text" | "video" | "audio"
    ) && !subtype.is_empty()
        && !subtype.contains('/')
        && !subtype.contains('.')
}

fn alert_text(err: &IntakeError) -> String {
    if err.is_validation() {
        format!("alert: {INVALID_TYPE_ALERT}")
    } else {
        format!("error: {err}")
    }
}

fn open_session(args: &ClassifierArgs) -> Session {
    let mut session = Session::new(model_slot(args));
    session.wait_for_model(Duration::from_secs(args.model_wait_sec));
    session
}

fn upload_path(session: &mut Session, path: &Path, media_type: Option<&str>) -> Result<()> {
    let file = read_upload(path, media_type)?;
    match session.upload(file) {
        Ok(()) => Ok(()),
        Err(err) if err.is_validation() => bail!("{INVALID_TYPE_ALERT} ({err})"),
        Err(err) => Err(err).with_context(|| format!("failed to load {}", path.display())),
    }
}

fn read_upload(path: &Path, media_type: Option<&str>) -> Result<UploadFile> {
    Ok(UploadFile::from_path(path, media_type)?)
}

/// Start loading whichever vision model the flags or environment select.
fn model_slot(args: &ClassifierArgs) -> ModelSlot {
    let timeout = Duration::from_secs(
        args.timeout_sec
            .or_else(|| env_value(TIMEOUT_ENV).and_then(|v| v.trim().parse().ok()))
            .unwrap_or(DEFAULT_TIMEOUT_SEC)
            .max(1),
    );

    if let Some(command_line) = args
        .classifier_cmd
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env_value(CLASSIFIER_CMD_ENV))
    {
        log::info!("loading vision model from command `{command_line}`");
        return ModelSlot::spawn(CommandLoader {
            command_line,
            timeout,
        });
    }

    if let Some(path) = args
        .predictions
        .clone()
        .or_else(|| env_value(PREDICTIONS_ENV).map(PathBuf::from))
    {
        log::info!("loading fixed predictions from {}", path.display());
        return ModelSlot::spawn(PredictionsFileLoader { path });
    }

    log::info!("no vision model configured; images will not be classified");
    ModelSlot::empty()
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}
