//! One user session: the state the widget keeps between events.

use crate::classify::{classify_or_fallback, ModelSlot, ModelStatus, Outcome};
use crate::compose::compose_alt_texts;
use crate::intake::{self, IntakeError, Preview, UploadFile, UploadedImage};
use serde::Serialize;

/// Where the intake/classification adapter stands for the latest upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Validating,
    Rejected,
    Decoding,
    Decoded,
    Classifying,
    Classified,
    ClassificationFailed,
}

#[derive(Debug)]
pub enum SessionEvent {
    Upload(UploadFile),
    SetKeywords(String),
    SetDescription(String),
    Generate,
    Reset,
    /// Pick up a model that finished loading in the background.
    ModelPoll,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub phase: Phase,
    pub model: ModelStatus,
    pub keywords: String,
    pub description: String,
    pub preview: Option<Preview>,
    pub attributes: Vec<String>,
    pub candidates: Vec<String>,
}

pub struct Session {
    keywords: String,
    description: String,
    image: Option<UploadedImage>,
    preview: Option<Preview>,
    attributes: Vec<String>,
    candidates: Vec<String>,
    phase: Phase,
    model: ModelSlot,
}

impl Session {
    pub fn new(model: ModelSlot) -> Self {
        Self {
            keywords: String::new(),
            description: String::new(),
            image: None,
            preview: None,
            attributes: Vec::new(),
            candidates: Vec::new(),
            phase: Phase::Idle,
            model,
        }
    }

    pub fn handle(&mut self, event: SessionEvent) -> Result<(), IntakeError> {
        match event {
            SessionEvent::Upload(file) => self.upload(file),
            SessionEvent::SetKeywords(text) => {
                self.set_keywords(text);
                Ok(())
            }
            SessionEvent::SetDescription(text) => {
                self.set_description(text);
                Ok(())
            }
            SessionEvent::Generate => {
                self.generate();
                Ok(())
            }
            SessionEvent::Reset => {
                self.reset();
                Ok(())
            }
            SessionEvent::ModelPoll => {
                self.poll_model();
                Ok(())
            }
        }
    }

    /// Validate, decode and classify a new upload.
    ///
    /// A rejected or undecodable file clears the preview and returns the
    /// error; the previous image and its attributes are kept.
    pub fn upload(&mut self, file: UploadFile) -> Result<(), IntakeError> {
        self.phase = Phase::Validating;
        let media_type = match intake::validate(&file) {
            Ok(media_type) => media_type,
            Err(err) => return Err(self.reject(err)),
        };

        self.phase = Phase::Decoding;
        let image = match intake::decode(file, media_type) {
            Ok(image) => image,
            Err(err) => return Err(self.reject(err)),
        };

        log::info!("accepted {} ({})", image.name, image.media_type);
        self.preview = Some(image.preview());
        self.image = Some(image);
        self.phase = Phase::Decoded;
        self.analyze();
        Ok(())
    }

    /// Settle the model slot without classifying anything.
    pub fn poll_model(&mut self) -> ModelStatus {
        self.model.poll();
        self.model.status()
    }

    /// Classify the current image if the model is ready; otherwise do nothing.
    fn analyze(&mut self) {
        let Some(image) = self.image.as_ref() else {
            return;
        };
        let Some(model) = self.model.poll() else {
            log::info!("vision model not ready; keeping previous attributes");
            return;
        };

        self.phase = Phase::Classifying;
        match classify_or_fallback(model, image) {
            Outcome::Classified(labels) => {
                self.attributes = labels;
                self.phase = Phase::Classified;
            }
            Outcome::Fallback(labels) => {
                self.attributes = labels;
                self.phase = Phase::ClassificationFailed;
            }
        }
    }

    pub fn set_keywords(&mut self, text: impl Into<String>) {
        self.keywords = text.into();
    }

    pub fn set_description(&mut self, text: impl Into<String>) {
        self.description = text.into();
    }

    pub fn generate(&mut self) -> &[String] {
        self.candidates = compose_alt_texts(&self.keywords, &self.description, &self.attributes);
        &self.candidates
    }

    /// Clear every field back to its initial value. The model stays loaded.
    pub fn reset(&mut self) {
        self.keywords.clear();
        self.description.clear();
        self.image = None;
        self.preview = None;
        self.attributes.clear();
        self.candidates.clear();
        self.phase = Phase::Idle;
    }

    pub fn wait_for_model(&mut self, timeout: std::time::Duration) -> bool {
        self.model.wait(timeout)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn preview(&self) -> Option<&Preview> {
        self.preview.as_ref()
    }

    pub fn image(&self) -> Option<&UploadedImage> {
        self.image.as_ref()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            model: self.model.status(),
            keywords: self.keywords.clone(),
            description: self.description.clone(),
            preview: self.preview.clone(),
            attributes: self.attributes.clone(),
            candidates: self.candidates.clone(),
        }
    }

    fn reject(&mut self, err: IntakeError) -> IntakeError {
        log::warn!("upload rejected: {err}");
        self.phase = Phase::Rejected;
        self.preview = None;
        err
    }
}
