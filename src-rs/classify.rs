//! Visual attribute extraction.
//!
//! The vision model is an external collaborator: something that can be loaded
//! once and then asked to rank labels for an image. This module owns the
//! policy around it (threshold, top-N, fallback on failure) and the
//! background load of the model.

use crate::intake::UploadedImage;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Predictions must score strictly above this to become attributes.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

pub const MAX_ATTRIBUTES: usize = 3;

pub const FALLBACK_ATTRIBUTES: [&str; 2] = ["product detail", "material texture"];

pub const MEDIA_TYPE_ENV: &str = "ALT_TEXT_MEDIA_TYPE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(alias = "className", alias = "class_name")]
    pub label: String,
    pub probability: f64,
}

impl Prediction {
    pub fn new(label: impl Into<String>, probability: f64) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }
}

pub trait Classifier: Send {
    /// Rank labels for an image, most likely first.
    fn classify(&self, image: &UploadedImage) -> Result<Vec<Prediction>>;

    fn name(&self) -> String;
}

/// One-time initializer for a [`Classifier`].
pub trait ModelLoader: Send + 'static {
    fn load(self) -> Result<Box<dyn Classifier>>;
}

/// Keep the first three predictions scoring above the threshold, in model order.
///
/// Probabilities outside `[0, 1]` (or NaN) never qualify.
pub fn top_attributes(predictions: &[Prediction]) -> Vec<String> {
    predictions
        .iter()
        .filter(|p| (0.0..=1.0).contains(&p.probability) && p.probability > CONFIDENCE_THRESHOLD)
        .take(MAX_ATTRIBUTES)
        .map(|p| p.label.clone())
        .collect()
}

pub fn fallback_attributes() -> Vec<String> {
    FALLBACK_ATTRIBUTES.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Classified(Vec<String>),
    /// The call failed; the fallback labels stand in.
    Fallback(Vec<String>),
}

impl Outcome {
    pub fn attributes(&self) -> &[String] {
        match self {
            Outcome::Classified(labels) | Outcome::Fallback(labels) => labels,
        }
    }

    pub fn into_attributes(self) -> Vec<String> {
        match self {
            Outcome::Classified(labels) | Outcome::Fallback(labels) => labels,
        }
    }
}

/// Run the classifier and never fail: errors resolve to the fallback labels.
pub fn classify_or_fallback(classifier: &dyn Classifier, image: &UploadedImage) -> Outcome {
    match classifier.classify(image) {
        Ok(predictions) => {
            log::debug!(
                "{} returned {} predictions for {}",
                classifier.name(),
                predictions.len(),
                image.name
            );
            Outcome::Classified(top_attributes(&predictions))
        }
        Err(err) => {
            log::warn!("vision model error ({}): {err:#}", classifier.name());
            Outcome::Fallback(fallback_attributes())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ModelStatus {
    Absent,
    Loading,
    Ready(String),
    Failed(String),
}

/// Holds the session's model while it loads on a background thread.
pub struct ModelSlot {
    pending: Option<Receiver<Result<Box<dyn Classifier>>>>,
    model: Option<Box<dyn Classifier>>,
    failure: Option<String>,
}

impl ModelSlot {
    /// No model configured; classification is always a no-op.
    pub fn empty() -> Self {
        Self {
            pending: None,
            model: None,
            failure: None,
        }
    }

    pub fn ready(model: Box<dyn Classifier>) -> Self {
        Self {
            pending: None,
            model: Some(model),
            failure: None,
        }
    }

    /// Start loading in the background and return immediately.
    pub fn spawn<L: ModelLoader>(loader: L) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // The receiver may be gone if the session ended first.
            let _ = tx.send(loader.load());
        });
        Self {
            pending: Some(rx),
            model: None,
            failure: None,
        }
    }

    /// Non-blocking; returns the model once it has finished loading.
    pub fn poll(&mut self) -> Option<&dyn Classifier> {
        let received = self.pending.as_ref().map(Receiver::try_recv);
        match received {
            Some(Ok(result)) => self.settle(result),
            Some(Err(TryRecvError::Disconnected)) => {
                self.settle(Err(anyhow::anyhow!("model loader exited without a result")))
            }
            Some(Err(TryRecvError::Empty)) | None => {}
        }
        self.model.as_deref()
    }

    /// Block until the model settles or `timeout` elapses. Returns true when ready.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let received = self.pending.as_ref().map(|rx| rx.recv_timeout(timeout));
        match received {
            Some(Ok(result)) => self.settle(result),
            Some(Err(RecvTimeoutError::Timeout)) => {
                log::info!("model still loading after {}s", timeout.as_secs());
            }
            Some(Err(RecvTimeoutError::Disconnected)) => {
                self.settle(Err(anyhow::anyhow!("model loader exited without a result")))
            }
            None => {}
        }
        self.model.is_some()
    }

    pub fn status(&self) -> ModelStatus {
        if let Some(model) = &self.model {
            ModelStatus::Ready(model.name())
        } else if let Some(reason) = &self.failure {
            ModelStatus::Failed(reason.clone())
        } else if self.pending.is_some() {
            ModelStatus::Loading
        } else {
            ModelStatus::Absent
        }
    }

    fn settle(&mut self, result: Result<Box<dyn Classifier>>) {
        self.pending = None;
        match result {
            Ok(model) => {
                log::info!("vision model ready: {}", model.name());
                self.model = Some(model);
            }
            Err(err) => {
                log::warn!("vision model failed to load: {err:#}");
                self.failure = Some(format!("{err:#}"));
            }
        }
    }
}

/// Parse a classifier's JSON output: a bare array or `{"predictions": [...]}`.
pub fn parse_predictions(raw: &str) -> Result<Vec<Prediction>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        List(Vec<Prediction>),
        Wrapped { predictions: Vec<Prediction> },
    }

    let payload: Payload =
        serde_json::from_str(raw.trim()).context("classifier output is not a prediction list")?;
    Ok(match payload {
        Payload::List(list) | Payload::Wrapped { predictions: list } => list,
    })
}

/// Classifier backed by an external program.
///
/// The raw image bytes are written to the child's stdin and its stdout is
/// parsed with [`parse_predictions`]. The media type is passed in
/// `ALT_TEXT_MEDIA_TYPE`.
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandClassifier {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl Classifier for CommandClassifier {
    fn classify(&self, image: &UploadedImage) -> Result<Vec<Prediction>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(MEDIA_TYPE_ENV, image.media_type.as_mime())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start classifier `{}`", self.describe()))?;

        // Feed stdin from a separate thread so a child that writes before it
        // finishes reading cannot deadlock against us.
        let writer = child.stdin.take().map(|mut stdin| {
            let bytes = image.bytes.clone();
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            })
        });

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "classifier `{}` timed out after {:?}",
                    self.describe(),
                    self.timeout
                );
            }
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            bail!(
                "classifier `{}` exited with status {}: {}",
                self.describe(),
                status.code().unwrap_or(1),
                truncate_text(stderr.trim(), 400)
            );
        }
        parse_predictions(&stdout)
    }

    fn name(&self) -> String {
        format!("command:{}", self.program)
    }
}

/// Read a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

/// Loads a [`CommandClassifier`] from a command line.
///
/// The command line is split on whitespace with no shell quoting, so the
/// program path and its arguments must not contain spaces. Wrap anything
/// more involved in a script.
pub struct CommandLoader {
    pub command_line: String,
    pub timeout: Duration,
}

impl ModelLoader for CommandLoader {
    fn load(self) -> Result<Box<dyn Classifier>> {
        let mut parts = self.command_line.split_whitespace().map(str::to_string);
        let program = match parts.next() {
            Some(program) => program,
            None => bail!("classifier command is empty"),
        };
        if !executable_available(&program) {
            bail!("classifier executable not found: {program}");
        }
        Ok(Box::new(CommandClassifier {
            program,
            args: parts.collect(),
            timeout: self.timeout,
        }))
    }
}

/// Classifier that answers every image with the same stored predictions.
pub struct StaticClassifier {
    source: String,
    predictions: Vec<Prediction>,
}

impl StaticClassifier {
    pub fn new(source: impl Into<String>, predictions: Vec<Prediction>) -> Self {
        Self {
            source: source.into(),
            predictions,
        }
    }
}

impl Classifier for StaticClassifier {
    fn classify(&self, _image: &UploadedImage) -> Result<Vec<Prediction>> {
        Ok(self.predictions.clone())
    }

    fn name(&self) -> String {
        format!("static:{}", self.source)
    }
}

pub struct PredictionsFileLoader {
    pub path: PathBuf,
}

impl ModelLoader for PredictionsFileLoader {
    fn load(self) -> Result<Box<dyn Classifier>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("predictions file not found: {}", self.path.display()))?;
        let predictions = parse_predictions(&raw)
            .with_context(|| format!("invalid predictions JSON: {}", self.path.display()))?;
        Ok(Box::new(StaticClassifier::new(
            self.path.display().to_string(),
            predictions,
        )))
    }
}

fn executable_available(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Path::new(program).is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "...<truncated>"
}


#[cfg(test)]
mod tests {
    use super::stubs::*;
    use super::*;
    use crate::intake::{accept, fixtures::png_upload};
    use tempfile::tempdir;

    fn sample_image() -> UploadedImage {
        accept(png_upload("sample.png", 4, 4)).unwrap()
    }

    #[test]
    fn keeps_first_three_above_threshold_in_model_order() {
        let preds = vec![
            Prediction::new("tote bag", 0.91),
            Prediction::new("purse", 0.60),
            Prediction::new("backpack", 0.75),
            Prediction::new("wallet", 0.30),
            Prediction::new("mailbag", 0.65),
            Prediction::new("sack", 0.62),
        ];
        assert_eq!(top_attributes(&preds), vec!["tote bag", "backpack", "mailbag"]);
    }

    #[test]
    fn no_qualifying_predictions_is_empty_not_fallback() {
        let classifier = fixed(&[("lamp", 0.6), ("shade", 0.2)]);
        let outcome = classify_or_fallback(&classifier, &sample_image());
        assert_eq!(outcome, Outcome::Classified(Vec::new()));
    }

    #[test]
    fn failure_yields_fallback_labels() {
        let outcome = classify_or_fallback(&FailingClassifier, &sample_image());
        assert_eq!(
            outcome,
            Outcome::Fallback(vec!["product detail".to_string(), "material texture".to_string()])
        );
    }

    #[test]
    fn parses_array_and_wrapped_payloads() {
        let list = parse_predictions(r#"[{"className": "mug", "probability": 0.8}]"#).unwrap();
        assert_eq!(list, vec![Prediction::new("mug", 0.8)]);

        let wrapped =
            parse_predictions(r#"{"predictions": [{"label": "cup", "probability": 0.7}]}"#)
                .unwrap();
        assert_eq!(wrapped[0].label, "cup");
    }

    #[test]
    fn out_of_range_probabilities_never_qualify() {
        let preds = parse_predictions(
            r#"[{"label": "mug", "probability": 0.9}, {"label": "x", "probability": 1.5}]"#,
        )
        .unwrap();
        assert_eq!(preds.len(), 2);
        let classifier = StaticClassifier::new("test", preds);
        assert_eq!(
            classify_or_fallback(&classifier, &sample_image()),
            Outcome::Classified(vec!["mug".to_string()])
        );

        let big = fixed(&[("big", 1.5), ("nan", f64::NAN)]);
        assert_eq!(
            classify_or_fallback(&big, &sample_image()),
            Outcome::Classified(Vec::new())
        );
    }

    #[test]
    fn predictions_file_with_out_of_range_entry_still_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preds.json");
        fs::write(
            &path,
            r#"[{"label": "mug", "probability": 0.9}, {"label": "x", "probability": 1.5}]"#,
        )
        .unwrap();
        let model = PredictionsFileLoader { path }.load().unwrap();
        assert_eq!(
            classify_or_fallback(model.as_ref(), &sample_image()).into_attributes(),
            vec!["mug"]
        );
    }

    #[test]
    fn malformed_output_is_an_error() {
        assert!(parse_predictions("not json").is_err());
        assert!(parse_predictions(r#"[{"label": "x"}]"#).is_err());
    }

    #[test]
    fn empty_slot_never_yields_a_model() {
        let mut slot = ModelSlot::empty();
        assert!(slot.poll().is_none());
        assert!(!slot.wait(Duration::from_millis(10)));
        assert_eq!(slot.status(), ModelStatus::Absent);
    }

    #[test]
    fn background_load_becomes_ready() {
        let mut slot = ModelSlot::spawn(SlowLoader {
            delay: Duration::from_millis(20),
            predictions: vec![Prediction::new("vase", 0.9)],
        });
        assert!(slot.wait(Duration::from_secs(5)));
        assert_eq!(slot.status(), ModelStatus::Ready("static:slow".to_string()));
        let model = slot.poll().unwrap();
        assert_eq!(
            classify_or_fallback(model, &sample_image()).into_attributes(),
            vec!["vase"]
        );
    }

    #[test]
    fn failed_load_is_reported_and_stays_absent() {
        let mut slot = ModelSlot::spawn(BrokenLoader);
        assert!(!slot.wait(Duration::from_secs(5)));
        assert!(matches!(slot.status(), ModelStatus::Failed(reason) if reason.contains("weights missing")));
        assert!(slot.poll().is_none());
    }

    #[test]
    fn predictions_file_loader_reads_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preds.json");
        fs::write(&path, r#"[{"label": "sneaker", "probability": 0.97}]"#).unwrap();
        let model = PredictionsFileLoader { path }.load().unwrap();
        assert_eq!(
            model.classify(&sample_image()).unwrap(),
            vec![Prediction::new("sneaker", 0.97)]
        );
    }

    #[test]
    fn command_loader_rejects_missing_executable() {
        let err = CommandLoader {
            command_line: "definitely-not-a-real-classifier-binary".to_string(),
            timeout: Duration::from_secs(1),
        }
        .load()
        .err()
        .unwrap();
        assert!(err.to_string().contains("not found"));

        assert!(CommandLoader {
            command_line: "   ".to_string(),
            timeout: Duration::from_secs(1),
        }
        .load()
        .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_reads_stdout_json() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("classify.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\nprintf '[{\"className\":\"%s\",\"probability\":0.88}]' \"$ALT_TEXT_MEDIA_TYPE\"\n",
        )
        .unwrap();
        let model = CommandLoader {
            command_line: format!("sh {}", script.display()),
            timeout: Duration::from_secs(10),
        }
        .load()
        .unwrap();
        let outcome = classify_or_fallback(model.as_ref(), &sample_image());
        assert_eq!(outcome, Outcome::Classified(vec!["image/png".to_string()]));
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_nonzero_exit_falls_back() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("broken.sh");
        fs::write(&script, "#!/bin/sh\necho 'model crashed' >&2\nexit 3\n").unwrap();
        let model = CommandLoader {
            command_line: format!("sh {}", script.display()),
            timeout: Duration::from_secs(10),
        }
        .load()
        .unwrap();

        let err = model.classify(&sample_image()).unwrap_err();
        assert!(format!("{err:#}").contains("model crashed"));

        let outcome = classify_or_fallback(model.as_ref(), &sample_image());
        assert_eq!(outcome.attributes(), fallback_attributes().as_slice());
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_timeout_falls_back() {
        let model = CommandLoader {
            command_line: "sleep 5".to_string(),
            timeout: Duration::from_millis(200),
        }
        .load()
        .unwrap();
        let err = model.classify(&sample_image()).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn command_classifier_with_noisy_stderr_fails_fast() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("noisy.sh");
        // 256 KiB of stderr, well past a pipe buffer.
        fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\nhead -c 262144 /dev/zero | tr '\\0' 'e' >&2\nexit 2\n",
        )
        .unwrap();
        let model = CommandLoader {
            command_line: format!("sh {}", script.display()),
            timeout: Duration::from_secs(30),
        }
        .load()
        .unwrap();

        let started = std::time::Instant::now();
        let err = model.classify(&sample_image()).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(err.to_string().contains("exited with status 2"));
    }

    #[cfg(unix)]
    #[test]
    fn command_line_arguments_reach_the_classifier() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("label.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\nprintf '[{\"label\":\"%s-%s\",\"probability\":0.9}]' \"$1\" \"$2\"\n",
        )
        .unwrap();
        let model = CommandLoader {
            command_line: format!("sh  {}   leather   strap ", script.display()),
            timeout: Duration::from_secs(10),
        }
        .load()
        .unwrap();
        assert_eq!(
            classify_or_fallback(model.as_ref(), &sample_image()).into_attributes(),
            vec!["leather-strap"]
        );
    }
}
