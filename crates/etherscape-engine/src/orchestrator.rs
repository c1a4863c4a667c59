//! Generation Orchestrator: theme resolution, provider fallback, realtime
//! hand-off and the self-scheduling evolution loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherscape_contracts::dimensions::{map_aspect_ratio_to_dimensions, Dimensions};
use etherscape_contracts::history::{HistoryItem, HistoryRecorder, NewHistoryItem};
use etherscape_contracts::models::{Capability, ModelSelector};
use etherscape_contracts::providers::{default_fallback_order, fallback_sequence};
use etherscape_contracts::settings::{AdvancedParams, GenerationSettings, MediaType};

use crate::dispatch::{DispatchOptions, ImageDispatcher, ProviderError, ProviderErrorKind};
use crate::media::extension_for_mime;
use crate::notify::{Notice, Notifier};
use crate::realtime::{RealtimeEvent, RealtimeGenerator, RealtimeState, RealtimeUpdate};
use crate::theme::ThemeGenerator;
use crate::upload::{CloudUploader, UploadRequest};

pub const DEFAULT_EVOLUTION_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub evolution_delay: Duration,
    /// Provider walk order; rotated to start at the selected provider.
    pub fallback_order: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            evolution_delay: DEFAULT_EVOLUTION_DELAY,
            fallback_order: default_fallback_order(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ThemeResolution,
    ProviderFatal,
    Exhausted,
    Realtime,
    History,
    Unsupported,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThemeResolution => "theme_resolution",
            Self::ProviderFatal => "provider_fatal",
            Self::Exhausted => "exhausted",
            Self::Realtime => "realtime",
            Self::History => "history",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GenerationFailure {}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(HistoryItem),
    AwaitingRealtime { generation_id: u64, provider: String },
    Failed(GenerationFailure),
    /// A recurring step fired after the session stopped playing.
    Skipped,
}

/// Provider/model the session moved to after a fallback switch. It only
/// redirects requests that still select `replaces`, and a new evolution
/// session starts without one.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPreference {
    /// Provider the user had selected when the first switch happened.
    pub replaces: String,
    pub provider: String,
    pub model: String,
    pub params: AdvancedParams,
}

pub struct Collaborators {
    pub theme: Box<dyn ThemeGenerator>,
    pub dispatcher: Box<dyn ImageDispatcher>,
    pub realtime: Box<dyn RealtimeGenerator>,
    pub history: Box<dyn HistoryRecorder>,
    pub uploader: Option<Box<dyn CloudUploader>>,
    pub notifier: Box<dyn Notifier>,
}

struct PendingStep {
    due: Instant,
    settings: GenerationSettings,
}

/// A successful provider result on its way into history.
struct Attempt {
    settings: GenerationSettings,
    prompt: String,
    next_theme: String,
    provider: String,
    model: String,
    dimensions: Dimensions,
    params: AdvancedParams,
    negative_prompt: Option<String>,
}

struct PendingRealtime {
    generation_id: u64,
    attempt: Attempt,
    recurring: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    playing: Arc<AtomicBool>,
    session_active: bool,
    evolving_concept: Option<String>,
    last_settings: Option<GenerationSettings>,
    pending_step: Option<PendingStep>,
    pending_realtime: Option<PendingRealtime>,
    preference: Option<ProviderPreference>,
    preview: Option<String>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            playing: Arc::new(AtomicBool::new(false)),
            session_active: false,
            evolving_concept: None,
            last_settings: None,
            pending_step: None,
            pending_realtime: None,
            preference: None,
            preview: None,
        }
    }

    /// Shared with the runner handle so a stop lands while a step is blocked.
    pub fn playing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.playing)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn evolving_concept(&self) -> Option<&str> {
        self.evolving_concept.as_deref()
    }

    pub fn last_settings(&self) -> Option<&GenerationSettings> {
        self.last_settings.as_ref()
    }

    pub fn preference(&self) -> Option<&ProviderPreference> {
        self.preference.as_ref()
    }

    /// Latest image shown to the user, including intermediate realtime frames.
    pub fn preview(&self) -> Option<&str> {
        self.preview.as_deref()
    }

    pub fn realtime_state(&self) -> RealtimeState {
        self.collaborators.realtime.state()
    }

    pub fn history(&self) -> &dyn HistoryRecorder {
        self.collaborators.history.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_step.as_ref().map(|step| step.due)
    }

    pub fn perform_single_generation(&mut self, settings: GenerationSettings) -> StepOutcome {
        self.teardown("single generation requested");
        let settings = self.apply_preference(settings);
        self.perform_step(settings, false)
    }

    pub fn start_evolution(&mut self, settings: GenerationSettings) -> StepOutcome {
        self.pending_step = None;
        self.pending_realtime = None;
        self.collaborators.realtime.disconnect();
        self.preference = None;
        self.playing.store(true, Ordering::SeqCst);
        self.session_active = true;
        self.evolving_concept = Some(settings.concept.clone());
        self.perform_step(settings, true)
    }

    pub fn stop_evolution(&mut self) {
        self.teardown("stopped by user");
    }

    /// Runs the pending evolution step once its deadline has passed.
    pub fn run_due(&mut self, now: Instant) -> Option<StepOutcome> {
        if self.pending_step.as_ref()?.due > now {
            return None;
        }
        let step = self.pending_step.take()?;
        Some(self.perform_step(step.settings, true))
    }

    /// Completion path for realtime generations. Updates whose id does not
    /// match the pending generation are ignored, so each generation completes
    /// at most once.
    pub fn handle_realtime(&mut self, update: RealtimeUpdate) -> Option<StepOutcome> {
        let pending_id = self.pending_realtime.as_ref()?.generation_id;
        if pending_id != update.generation_id {
            return None;
        }
        match update.event {
            RealtimeEvent::Progress(url) => {
                self.preview = Some(url.clone());
                self.collaborators.notifier.notify(&Notice::RealtimeProgress {
                    generation_id: update.generation_id,
                    image_url: url,
                });
                None
            }
            RealtimeEvent::Done(url) => {
                let pending = self.pending_realtime.take()?;
                Some(self.complete(pending.attempt, url, pending.recurring))
            }
            RealtimeEvent::Failed(message) => {
                let pending = self.pending_realtime.take()?;
                Some(self.fail(FailureKind::Realtime, message, pending.recurring))
            }
            RealtimeEvent::Closed => {
                let pending = self.pending_realtime.take()?;
                Some(self.fail(
                    FailureKind::Realtime,
                    "Realtime connection closed before the image completed.".to_string(),
                    pending.recurring,
                ))
            }
        }
    }

    fn teardown(&mut self, reason: &str) {
        let was_active = self.session_active;
        self.playing.store(false, Ordering::SeqCst);
        self.session_active = false;
        self.pending_step = None;
        self.pending_realtime = None;
        self.collaborators.realtime.disconnect();
        if was_active {
            self.collaborators.notifier.notify(&Notice::EvolutionStopped {
                reason: reason.to_string(),
            });
        }
    }

    fn perform_step(&mut self, settings: GenerationSettings, recurring: bool) -> StepOutcome {
        self.pending_step = None;
        if recurring && !self.is_playing() {
            return StepOutcome::Skipped;
        }
        self.last_settings = Some(settings.clone());

        if settings.media_type != MediaType::Image {
            return self.fail(
                FailureKind::Unsupported,
                format!(
                    "{} generation is not supported; only images can be generated.",
                    settings.media_type.as_str()
                ),
                recurring,
            );
        }

        self.collaborators.notifier.notify(&Notice::StepStarted {
            recurring,
            concept: settings.concept.clone(),
            provider: settings.selected_provider.clone(),
        });

        let (prompt, next_theme) = match settings.prompt_override() {
            Some(prompt) => (prompt.to_string(), settings.concept.clone()),
            None => match self.collaborators.theme.generate(
                &settings.concept,
                &settings.art_style,
                settings.use_search_grounding,
            ) {
                Ok(theme) => (theme.image_prompt, theme.next_theme),
                Err(err) => {
                    return self.fail(
                        FailureKind::ThemeResolution,
                        format!("Theme generation failed: {err:#}"),
                        recurring,
                    )
                }
            },
        };

        self.walk_providers(settings, prompt, next_theme, recurring)
    }

    fn walk_providers(
        &mut self,
        settings: GenerationSettings,
        prompt: String,
        next_theme: String,
        recurring: bool,
    ) -> StepOutcome {
        let capability = if settings.base_image.is_some() {
            Capability::ImageToImage
        } else {
            Capability::TextToImage
        };
        let selected = settings.selected_provider.trim().to_string();
        let mut last_error: Option<ProviderError> = None;

        for provider_id in fallback_sequence(&self.config.fallback_order, &selected) {
            let Some(entry) = settings.catalog.get(&provider_id) else {
                continue;
            };
            let is_selected = provider_id == selected;
            let requested = is_selected.then_some(settings.selected_model.as_str());
            let Ok(selection) =
                ModelSelector::new(&settings.catalog).select(&provider_id, requested, capability)
            else {
                continue;
            };
            let api_key = settings.api_key(&provider_id);
            if entry.requires_api_key && api_key.is_none() {
                continue;
            }

            let model = selection.model;
            let params = if is_selected {
                settings.params.clone()
            } else {
                model.default_params()
            };
            let negative_prompt = settings
                .negative_prompt
                .clone()
                .filter(|_| model.supports_negative_prompt);
            let options = DispatchOptions {
                prompt: prompt.clone(),
                negative_prompt: negative_prompt.clone(),
                dimensions: map_aspect_ratio_to_dimensions(&settings.aspect_ratio, model.base_dimension),
                aspect_ratio: settings.aspect_ratio.clone(),
                params: params.clone(),
                base_image: settings.base_image.clone(),
            };
            let attempt = Attempt {
                settings: settings.clone(),
                prompt: prompt.clone(),
                next_theme: next_theme.clone(),
                provider: provider_id.clone(),
                model: model.id.clone(),
                dimensions: options.dimensions,
                params,
                negative_prompt,
            };

            if entry.realtime {
                match self.collaborators.realtime.generate(
                    api_key.unwrap_or_default(),
                    &model.id,
                    &options,
                ) {
                    Ok(generation_id) => {
                        if !is_selected {
                            self.switch_provider(&selected, &provider_id, &model.id, model.default_params());
                        }
                        self.pending_realtime = Some(PendingRealtime {
                            generation_id,
                            attempt,
                            recurring,
                        });
                        return StepOutcome::AwaitingRealtime {
                            generation_id,
                            provider: provider_id,
                        };
                    }
                    Err(err) => {
                        let err = ProviderError::transient(
                            &provider_id,
                            format!("{provider_id} realtime start failed: {err:#}"),
                        );
                        self.notify_fallback(&err);
                        last_error = Some(err);
                        continue;
                    }
                }
            }

            match self
                .collaborators
                .dispatcher
                .generate(&provider_id, &model.id, api_key, &options)
            {
                Ok(media_url) => {
                    if !is_selected {
                        self.switch_provider(&selected, &provider_id, &model.id, model.default_params());
                    }
                    return self.complete(attempt, media_url, recurring);
                }
                Err(err) if err.is_recoverable() => {
                    self.notify_fallback(&err);
                    last_error = Some(err);
                }
                Err(err) => return self.fail(FailureKind::ProviderFatal, err.message, recurring),
            }
        }

        let message = match last_error {
            Some(err) => format!("All providers failed. Last error: {}", err.message),
            None => "No configured provider can serve this request. Add an API key or pick another provider."
                .to_string(),
        };
        self.fail(FailureKind::Exhausted, message, recurring)
    }

    fn notify_fallback(&self, err: &ProviderError) {
        let kind = match err.kind {
            ProviderErrorKind::Config => ProviderErrorKind::Config,
            _ => ProviderErrorKind::Transient,
        };
        self.collaborators.notifier.notify(&Notice::ProviderFallback {
            provider: err.provider.clone(),
            kind,
            message: err.message.clone(),
        });
    }

    fn switch_provider(&mut self, from: &str, to: &str, model: &str, params: AdvancedParams) {
        self.collaborators.notifier.notify(&Notice::ProviderSwitched {
            from: from.to_string(),
            to: to.to_string(),
            model: model.to_string(),
        });
        let replaces = match self.preference.take() {
            Some(previous) if previous.provider == from => previous.replaces,
            _ => from.to_string(),
        };
        self.preference = Some(ProviderPreference {
            replaces,
            provider: to.to_string(),
            model: model.to_string(),
            params,
        });
    }

    fn complete(&mut self, attempt: Attempt, media_url: String, recurring: bool) -> StepOutcome {
        let settings = &attempt.settings;
        let recorded = self.collaborators.history.add(NewHistoryItem {
            media_url: media_url.clone(),
            prompt: attempt.prompt.clone(),
            concept: settings.concept.clone(),
            media_type: settings.media_type,
            art_style: settings.art_style.clone(),
            aspect_ratio: settings.aspect_ratio.clone(),
            provider_id: attempt.provider.clone(),
            model_id: attempt.model.clone(),
            negative_prompt: attempt.negative_prompt.clone(),
            params: attempt.params.clone(),
            dimensions: attempt.dimensions,
            derived_from: settings.derived_from.clone(),
        });
        let mut item = match recorded {
            Ok(item) => item,
            Err(err) => {
                return self.fail(
                    FailureKind::History,
                    format!("Failed to record history: {err:#}"),
                    recurring,
                )
            }
        };
        self.preview = Some(media_url.clone());
        self.collaborators.notifier.notify(&Notice::GenerationCompleted {
            item_id: item.id.clone(),
            provider: item.provider_id.clone(),
            model: item.model_id.clone(),
            media_url,
        });

        if settings.drive.active() {
            if let Some(file_id) = self.upload(&item) {
                item.drive_file_id = Some(file_id);
            }
        }

        if recurring && self.is_playing() {
            self.schedule_next(&attempt);
        }
        StepOutcome::Completed(item)
    }

    fn upload(&mut self, item: &HistoryItem) -> Option<String> {
        let uploader = self.collaborators.uploader.as_ref()?;
        let request = UploadRequest {
            media_url: item.media_url.clone(),
            filename: format!("etherscape-{}.{}", item.id, media_extension(&item.media_url)),
            prompt: item.prompt.clone(),
            concept: item.concept.clone(),
            art_style: item.art_style.clone(),
            aspect_ratio: item.aspect_ratio.clone(),
            original_id: item.id.clone(),
            provider_id: item.provider_id.clone(),
            model_id: item.model_id.clone(),
        };
        let uploaded = match uploader.upload(&request) {
            Ok(uploaded) => uploaded,
            Err(err) => {
                self.collaborators.notifier.notify(&Notice::UploadFailed {
                    item_id: item.id.clone(),
                    message: format!("{err:#}"),
                });
                return None;
            }
        };
        if let Err(err) = self
            .collaborators
            .history
            .attach_drive_file(&item.id, &uploaded.id)
        {
            self.collaborators.notifier.notify(&Notice::UploadFailed {
                item_id: item.id.clone(),
                message: format!("uploaded as {} but history update failed: {err:#}", uploaded.id),
            });
            return None;
        }
        self.collaborators.notifier.notify(&Notice::UploadCompleted {
            item_id: item.id.clone(),
            file_id: uploaded.id.clone(),
        });
        Some(uploaded.id)
    }

    fn schedule_next(&mut self, attempt: &Attempt) {
        let current = attempt.settings.concept.trim();
        let candidate = attempt.next_theme.trim();
        let next_concept = if candidate.is_empty() || candidate.eq_ignore_ascii_case(current) {
            current.to_string()
        } else {
            candidate.to_string()
        };
        self.evolving_concept = Some(next_concept.clone());

        let mut next = self.apply_preference(attempt.settings.with_concept(next_concept.clone()));
        next.prompt_override = None;
        next.derived_from = None;

        let delay = self.config.evolution_delay;
        self.pending_step = Some(PendingStep {
            due: Instant::now() + delay,
            settings: next,
        });
        self.collaborators.notifier.notify(&Notice::EvolutionScheduled {
            next_concept,
            delay,
        });
    }

    fn apply_preference(&self, settings: GenerationSettings) -> GenerationSettings {
        match self.preference.as_ref() {
            Some(preference)
                if preference.replaces == settings.selected_provider.trim()
                    && preference.provider != settings.selected_provider.trim() =>
            {
                settings.with_selection(
                    preference.provider.clone(),
                    preference.model.clone(),
                    preference.params.clone(),
                )
            }
            _ => settings,
        }
    }

    fn fail(&mut self, kind: FailureKind, message: String, recurring: bool) -> StepOutcome {
        self.collaborators.notifier.notify(&Notice::GenerationFailed {
            kind,
            message: message.clone(),
        });
        if recurring {
            self.teardown(&message);
        }
        StepOutcome::Failed(GenerationFailure { kind, message })
    }
}

fn media_extension(media_url: &str) -> &'static str {
    media_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .map(extension_for_mime)
        .unwrap_or("png")
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, Result};
    use etherscape_contracts::history::{JsonHistoryStore, DEFAULT_HISTORY_CAPACITY};
    use etherscape_contracts::settings::{BaseImage, GenerationSettings, MediaType};

    use super::{Collaborators, FailureKind, Orchestrator, OrchestratorConfig, StepOutcome};
    use crate::dispatch::{DispatchOptions, DispatchResult, ImageDispatcher, ProviderError};
    use crate::notify::{Notice, Notifier};
    use crate::realtime::{RealtimeEvent, RealtimeGenerator, RealtimeState, RealtimeUpdate};
    use crate::theme::{ThemeGenerator, ThemeResult};
    use crate::upload::{CloudUploader, UploadRequest, UploadedFile};

    #[derive(Clone, Default)]
    struct StubTheme {
        calls: Arc<Mutex<Vec<String>>>,
        next: BTreeMap<String, String>,
        fail: bool,
    }

    impl ThemeGenerator for StubTheme {
        fn generate(&self, concept: &str, art_style: &str, _grounding: bool) -> Result<ThemeResult> {
            self.calls.lock().map_err(|_| anyhow!("poisoned"))?.push(concept.to_string());
            if self.fail {
                return Err(anyhow!("text model unavailable"));
            }
            Ok(ThemeResult {
                image_prompt: format!("{concept}, {art_style}"),
                next_theme: self.next.get(concept).cloned().unwrap_or_default(),
                grounding_sources: Vec::new(),
            })
        }
    }

    #[derive(Debug, Clone)]
    struct DispatchCall {
        provider: String,
        model: String,
        options: DispatchOptions,
    }

    /// Answers per provider from a queue; an empty queue yields a URL.
    #[derive(Clone, Default)]
    struct ScriptedDispatcher {
        calls: Arc<Mutex<Vec<DispatchCall>>>,
        script: Arc<Mutex<BTreeMap<String, VecDeque<DispatchResult<String>>>>>,
    }

    impl ScriptedDispatcher {
        fn push(&self, provider: &str, result: DispatchResult<String>) {
            if let Ok(mut script) = self.script.lock() {
                script.entry(provider.to_string()).or_default().push_back(result);
            }
        }

        fn providers(&self) -> Vec<String> {
            self.calls
                .lock()
                .map(|calls| calls.iter().map(|call| call.provider.clone()).collect())
                .unwrap_or_default()
        }

        fn last(&self) -> DispatchCall {
            self.calls
                .lock()
                .ok()
                .and_then(|calls| calls.last().cloned())
                .unwrap_or_else(|| panic!("no dispatch call"))
        }
    }

    impl ImageDispatcher for ScriptedDispatcher {
        fn generate(
            &self,
            provider_id: &str,
            model_id: &str,
            _api_key: Option<&str>,
            options: &DispatchOptions,
        ) -> DispatchResult<String> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(DispatchCall {
                    provider: provider_id.to_string(),
                    model: model_id.to_string(),
                    options: options.clone(),
                });
            }
            let scripted = self
                .script
                .lock()
                .ok()
                .and_then(|mut script| script.get_mut(provider_id).and_then(VecDeque::pop_front));
            scripted.unwrap_or_else(|| Ok(format!("https://cdn/{provider_id}/{model_id}.png")))
        }
    }

    #[derive(Clone, Default)]
    struct StubRealtime {
        started: Arc<Mutex<Vec<String>>>,
        disconnects: Arc<Mutex<u32>>,
    }

    impl StubRealtime {
        fn disconnect_count(&self) -> u32 {
            self.disconnects.lock().map(|count| *count).unwrap_or_default()
        }
    }

    impl RealtimeGenerator for StubRealtime {
        fn generate(&mut self, _api_key: &str, model_id: &str, _options: &DispatchOptions) -> Result<u64> {
            let mut started = self.started.lock().map_err(|_| anyhow!("poisoned"))?;
            started.push(model_id.to_string());
            Ok(started.len() as u64)
        }

        fn disconnect(&mut self) {
            if let Ok(mut count) = self.disconnects.lock() {
                *count += 1;
            }
        }

        fn state(&self) -> RealtimeState {
            RealtimeState::default()
        }
    }

    struct StubUploader {
        fail: bool,
    }

    impl CloudUploader for StubUploader {
        fn upload(&self, request: &UploadRequest) -> Result<UploadedFile> {
            if self.fail {
                return Err(anyhow!("token expired"));
            }
            Ok(UploadedFile {
                id: format!("drive-{}", request.original_id),
                name: request.filename.clone(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        notices: Arc<Mutex<Vec<Notice>>>,
    }

    impl RecordingNotifier {
        fn all(&self) -> Vec<Notice> {
            self.notices.lock().map(|rows| rows.clone()).unwrap_or_default()
        }

        fn count(&self, event_type: &str) -> usize {
            self.all()
                .iter()
                .filter(|notice| notice.event_type() == event_type)
                .count()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: &Notice) {
            if let Ok(mut rows) = self.notices.lock() {
                rows.push(notice.clone());
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        theme: StubTheme,
        dispatcher: ScriptedDispatcher,
        realtime: StubRealtime,
        notifier: RecordingNotifier,
    }

    fn harness_with(theme: StubTheme, uploader: Option<StubUploader>) -> Harness {
        let dispatcher = ScriptedDispatcher::default();
        let realtime = StubRealtime::default();
        let notifier = RecordingNotifier::default();
        let collaborators = Collaborators {
            theme: Box::new(theme.clone()),
            dispatcher: Box::new(dispatcher.clone()),
            realtime: Box::new(realtime.clone()),
            history: Box::new(JsonHistoryStore::in_memory(DEFAULT_HISTORY_CAPACITY)),
            uploader: uploader.map(|uploader| Box::new(uploader) as Box<dyn CloudUploader>),
            notifier: Box::new(notifier.clone()),
        };
        Harness {
            orchestrator: Orchestrator::new(OrchestratorConfig::default(), collaborators),
            theme,
            dispatcher,
            realtime,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(StubTheme::default(), None)
    }

    fn settings(provider: &str, model: &str, keys: &[&str]) -> GenerationSettings {
        let mut settings = GenerationSettings::new("Cosmic jellyfish ballet", "Impressionistic", provider, model);
        settings.aspect_ratio = "16:9".to_string();
        for provider in keys {
            settings
                .api_keys
                .insert(provider.to_string(), format!("{provider}-key"));
        }
        settings
    }

    fn completed(outcome: StepOutcome) -> etherscape_contracts::history::HistoryItem {
        match outcome {
            StepOutcome::Completed(item) => item,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    fn failed(outcome: StepOutcome) -> super::GenerationFailure {
        match outcome {
            StepOutcome::Failed(failure) => failure,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn evolution_end_to_end_adopts_next_theme() {
        let mut theme = StubTheme::default();
        theme
            .next
            .insert("Cosmic jellyfish ballet".to_string(), "Nebula tides".to_string());
        let mut h = harness_with(theme, None);

        let item = completed(
            h.orchestrator
                .start_evolution(settings("gemini", "imagen-4.0-generate-001", &["gemini"])),
        );
        assert_eq!(item.concept, "Cosmic jellyfish ballet");
        assert_eq!(item.prompt, "Cosmic jellyfish ballet, Impressionistic");
        assert_eq!((item.width, item.height), (1344, 768));
        assert_eq!(h.dispatcher.last().options.dimensions.width, 1344);
        assert_eq!(h.orchestrator.evolving_concept(), Some("Nebula tides"));
        assert_eq!(h.orchestrator.preview(), Some(item.media_url.as_str()));

        let due = h
            .orchestrator
            .next_deadline()
            .unwrap_or_else(|| panic!("next step scheduled"));
        assert!(due > Instant::now() + Duration::from_secs(9));
        assert!(h.orchestrator.run_due(Instant::now()).is_none());

        let second = h
            .orchestrator
            .run_due(Instant::now() + Duration::from_secs(11))
            .unwrap_or_else(|| panic!("due step should run"));
        assert_eq!(completed(second).concept, "Nebula tides");
        assert_eq!(
            h.theme.calls.lock().map(|calls| calls.clone()).unwrap_or_default(),
            vec!["Cosmic jellyfish ballet", "Nebula tides"]
        );
        assert_eq!(h.orchestrator.history().items().len(), 2);
        assert_eq!(h.notifier.count("evolution_scheduled"), 2);
    }

    #[test]
    fn quota_error_switches_provider_once() {
        let mut h = harness();
        h.dispatcher.push(
            "gemini",
            Err(ProviderError::from_status("gemini", 429, "RESOURCE_EXHAUSTED: quota exceeded")),
        );
        let item = completed(h.orchestrator.start_evolution(settings(
            "gemini",
            "imagen-4.0-generate-001",
            &["gemini", "stability"],
        )));

        assert_eq!(item.provider_id, "stability");
        assert_eq!(h.dispatcher.providers(), vec!["gemini", "stability"]);
        assert_eq!(h.notifier.count("provider_fallback"), 1);
        assert_eq!(h.notifier.count("provider_switched"), 1);
        let preference = h
            .orchestrator
            .preference()
            .unwrap_or_else(|| panic!("preference updated"));
        assert_eq!(preference.provider, "stability");

        let next = completed(
            h.orchestrator
                .run_due(Instant::now() + Duration::from_secs(11))
                .unwrap_or_else(|| panic!("due step")),
        );
        assert_eq!(next.provider_id, "stability");
        assert_eq!(h.dispatcher.providers(), vec!["gemini", "stability", "stability"]);
        assert_eq!(h.notifier.count("provider_switched"), 1);
    }

    #[test]
    fn new_session_forgets_previous_switch() {
        let mut h = harness();
        let request = settings("gemini", "imagen-4.0-generate-001", &["gemini", "stability"]);
        h.dispatcher.push(
            "gemini",
            Err(ProviderError::from_status("gemini", 429, "RESOURCE_EXHAUSTED: quota exceeded")),
        );
        let _ = completed(h.orchestrator.start_evolution(request.clone()));
        h.orchestrator.stop_evolution();

        let first = completed(h.orchestrator.start_evolution(request));
        assert_eq!(first.provider_id, "gemini");
        assert!(h.orchestrator.preference().is_none());
        let second = completed(
            h.orchestrator
                .run_due(Instant::now() + Duration::from_secs(11))
                .unwrap_or_else(|| panic!("due step")),
        );
        assert_eq!(second.provider_id, "gemini");
        assert_eq!(
            h.dispatcher.providers(),
            vec!["gemini", "stability", "gemini", "gemini"]
        );
        assert_eq!(h.notifier.count("provider_switched"), 1);
    }

    #[test]
    fn single_shot_after_switch_keeps_fallback_provider() {
        let mut h = harness();
        let request = settings("gemini", "imagen-4.0-generate-001", &["gemini", "stability"]);
        h.dispatcher.push(
            "gemini",
            Err(ProviderError::from_status("gemini", 503, "overloaded")),
        );
        let first = completed(h.orchestrator.perform_single_generation(request.clone()));
        assert_eq!(first.provider_id, "stability");

        let again = completed(h.orchestrator.perform_single_generation(request));
        assert_eq!(again.provider_id, "stability");
        assert_eq!(h.dispatcher.providers(), vec!["gemini", "stability", "stability"]);

        let explicit = completed(
            h.orchestrator
                .perform_single_generation(settings("leonardo", "", &["gemini", "stability", "leonardo"])),
        );
        assert_eq!(explicit.provider_id, "leonardo");
        assert_eq!(h.notifier.count("provider_switched"), 1);
    }

    #[test]
    fn fatal_error_stops_without_trying_next_provider() {
        let mut h = harness();
        h.dispatcher.push(
            "gemini",
            Err(ProviderError::from_status("gemini", 400, "prompt blocked by safety filter")),
        );
        let failure = failed(h.orchestrator.start_evolution(settings(
            "gemini",
            "imagen-4.0-generate-001",
            &["gemini", "stability"],
        )));
        assert_eq!(failure.kind, FailureKind::ProviderFatal);
        assert_eq!(h.dispatcher.providers(), vec!["gemini"]);
        assert!(!h.orchestrator.is_playing());
        assert!(h.orchestrator.next_deadline().is_none());
        assert_eq!(h.notifier.count("evolution_stopped"), 1);
    }

    #[test]
    fn exhausted_walk_reports_last_error() {
        let mut h = harness();
        h.dispatcher
            .push("gemini", Err(ProviderError::from_status("gemini", 503, "overloaded")));
        h.dispatcher
            .push("stability", Err(ProviderError::from_status("stability", 402, "payment required")));
        let failure = failed(h.orchestrator.start_evolution(settings(
            "gemini",
            "imagen-4.0-generate-001",
            &["gemini", "stability"],
        )));
        assert_eq!(failure.kind, FailureKind::Exhausted);
        assert!(failure.message.contains("stability request failed (402)"));
        assert!(!h.orchestrator.is_playing());
    }

    #[test]
    fn providers_without_keys_are_skipped() {
        let mut h = harness();
        let item = completed(
            h.orchestrator
                .perform_single_generation(settings("stability", "stable-image-core", &["gemini"])),
        );
        assert_eq!(item.provider_id, "gemini");
        assert_eq!(h.dispatcher.providers(), vec!["gemini"]);
        assert_eq!(h.notifier.count("provider_switched"), 1);

        let mut h = harness();
        let failure = failed(
            h.orchestrator
                .perform_single_generation(settings("gemini", "imagen-4.0-generate-001", &[])),
        );
        assert_eq!(failure.kind, FailureKind::Exhausted);
        assert!(h.dispatcher.providers().is_empty());
    }

    #[test]
    fn base_image_selects_image_to_image_model() {
        let mut h = harness();
        let mut request = settings("gemini", "imagen-4.0-generate-001", &["gemini"]);
        request.base_image = Some(BaseImage {
            url: "data:image/png;base64,AAAA".to_string(),
            strength: 0.6,
        });
        request.derived_from = Some("item-0".to_string());
        let item = completed(h.orchestrator.perform_single_generation(request));
        assert_eq!(h.dispatcher.last().model, "gemini-2.5-flash-image");
        assert_eq!(item.derived_from.as_deref(), Some("item-0"));
    }

    #[test]
    fn stop_cancels_pending_step_and_is_idempotent() {
        let mut h = harness();
        let _ = h
            .orchestrator
            .start_evolution(settings("gemini", "imagen-4.0-generate-001", &["gemini"]));
        assert!(h.orchestrator.next_deadline().is_some());

        h.orchestrator.stop_evolution();
        h.orchestrator.stop_evolution();
        assert!(h.orchestrator.next_deadline().is_none());
        assert!(h
            .orchestrator
            .run_due(Instant::now() + Duration::from_secs(60))
            .is_none());
        assert_eq!(h.notifier.count("evolution_stopped"), 1);
        assert_eq!(h.dispatcher.providers().len(), 1);
    }

    #[test]
    fn recurring_step_after_flag_flip_is_skipped() {
        let mut h = harness();
        let _ = h
            .orchestrator
            .start_evolution(settings("gemini", "imagen-4.0-generate-001", &["gemini"]));
        h.orchestrator
            .playing_flag()
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let outcome = h
            .orchestrator
            .run_due(Instant::now() + Duration::from_secs(11));
        assert_eq!(outcome, Some(StepOutcome::Skipped));
        assert_eq!(h.dispatcher.providers().len(), 1);
    }

    #[test]
    fn single_generation_stops_evolution_and_realtime() {
        let mut h = harness();
        let _ = h
            .orchestrator
            .start_evolution(settings("gemini", "imagen-4.0-generate-001", &["gemini"]));
        let disconnects_before = h.realtime.disconnect_count();

        let item = completed(
            h.orchestrator
                .perform_single_generation(settings("gemini", "imagen-4.0-generate-001", &["gemini"])),
        );
        assert_eq!(item.provider_id, "gemini");
        assert!(!h.orchestrator.is_playing());
        assert!(h.orchestrator.next_deadline().is_none());
        assert!(h.realtime.disconnect_count() > disconnects_before);
        assert_eq!(h.notifier.count("evolution_stopped"), 1);
    }

    #[test]
    fn realtime_generation_completes_exactly_once() {
        let mut theme = StubTheme::default();
        theme
            .next
            .insert("Cosmic jellyfish ballet".to_string(), "Nebula tides".to_string());
        let mut h = harness_with(theme, None);
        let outcome = h
            .orchestrator
            .start_evolution(settings("fal", "fal-ai/fast-lcm-diffusion", &["fal"]));
        let StepOutcome::AwaitingRealtime { generation_id, provider } = outcome else {
            panic!("expected realtime hand-off, got {outcome:?}");
        };
        assert_eq!(provider, "fal");
        assert!(h.dispatcher.providers().is_empty());

        let update = |event| RealtimeUpdate {
            generation_id,
            event,
        };
        assert!(h
            .orchestrator
            .handle_realtime(update(RealtimeEvent::Progress("https://fal.media/p.png".to_string())))
            .is_none());
        assert_eq!(h.orchestrator.preview(), Some("https://fal.media/p.png"));
        assert!(h
            .orchestrator
            .handle_realtime(RealtimeUpdate {
                generation_id: generation_id + 7,
                event: RealtimeEvent::Done("https://fal.media/stale.png".to_string()),
            })
            .is_none());

        let done = h
            .orchestrator
            .handle_realtime(update(RealtimeEvent::Done("https://fal.media/f.png".to_string())))
            .unwrap_or_else(|| panic!("first completion is delivered"));
        assert_eq!(completed(done).media_url, "https://fal.media/f.png");
        assert!(h
            .orchestrator
            .handle_realtime(update(RealtimeEvent::Done("https://fal.media/f.png".to_string())))
            .is_none());
        assert_eq!(h.orchestrator.history().items().len(), 1);
        assert_eq!(h.orchestrator.evolving_concept(), Some("Nebula tides"));
        assert!(h.orchestrator.next_deadline().is_some());
    }

    #[test]
    fn realtime_close_stops_recurring_session() {
        let mut h = harness();
        let outcome = h
            .orchestrator
            .start_evolution(settings("fal", "fal-ai/fast-lcm-diffusion", &["fal"]));
        let StepOutcome::AwaitingRealtime { generation_id, .. } = outcome else {
            panic!("expected realtime hand-off");
        };
        let failure = failed(
            h.orchestrator
                .handle_realtime(RealtimeUpdate {
                    generation_id,
                    event: RealtimeEvent::Closed,
                })
                .unwrap_or_else(|| panic!("close is delivered")),
        );
        assert_eq!(failure.kind, FailureKind::Realtime);
        assert!(!h.orchestrator.is_playing());
        assert_eq!(h.notifier.count("evolution_stopped"), 1);
    }

    #[test]
    fn theme_failure_stops_recurring_session() {
        let theme = StubTheme {
            fail: true,
            ..StubTheme::default()
        };
        let mut h = harness_with(theme, None);
        let failure = failed(
            h.orchestrator
                .start_evolution(settings("gemini", "imagen-4.0-generate-001", &["gemini"])),
        );
        assert_eq!(failure.kind, FailureKind::ThemeResolution);
        assert!(h.dispatcher.providers().is_empty());
        assert!(!h.orchestrator.is_playing());
    }

    #[test]
    fn prompt_override_skips_theme_and_keeps_concept() {
        let mut h = harness();
        let mut request = settings("gemini", "imagen-4.0-generate-001", &["gemini"]);
        request.prompt_override = Some("A lighthouse made of coral".to_string());
        let item = completed(h.orchestrator.start_evolution(request));
        assert_eq!(item.prompt, "A lighthouse made of coral");
        assert!(h.theme.calls.lock().map(|calls| calls.is_empty()).unwrap_or(false));
        assert_eq!(h.orchestrator.evolving_concept(), Some("Cosmic jellyfish ballet"));

        let next = completed(
            h.orchestrator
                .run_due(Instant::now() + Duration::from_secs(11))
                .unwrap_or_else(|| panic!("due step")),
        );
        assert_eq!(next.prompt, "Cosmic jellyfish ballet, Impressionistic");
    }

    #[test]
    fn non_image_media_is_rejected() {
        let mut h = harness();
        let mut request = settings("gemini", "imagen-4.0-generate-001", &["gemini"]);
        request.media_type = MediaType::Video;
        let failure = failed(h.orchestrator.perform_single_generation(request));
        assert_eq!(failure.kind, FailureKind::Unsupported);
        assert!(h.dispatcher.providers().is_empty());
    }

    #[test]
    fn drive_upload_attaches_file_id() {
        let mut h = harness_with(StubTheme::default(), Some(StubUploader { fail: false }));
        let mut request = settings("gemini", "imagen-4.0-generate-001", &["gemini"]);
        request.drive.enabled = true;
        request.drive.authenticated = true;
        let item = completed(h.orchestrator.perform_single_generation(request));
        let expected = format!("drive-{}", item.id);
        assert_eq!(item.drive_file_id.as_deref(), Some(expected.as_str()));
        assert_eq!(
            h.orchestrator.history().items()[0].drive_file_id.as_deref(),
            Some(expected.as_str())
        );
        assert_eq!(h.notifier.count("upload_completed"), 1);
    }

    #[test]
    fn drive_upload_failure_is_not_fatal() {
        let mut h = harness_with(StubTheme::default(), Some(StubUploader { fail: true }));
        let mut request = settings("gemini", "imagen-4.0-generate-001", &["gemini"]);
        request.drive.enabled = true;
        request.drive.authenticated = true;
        let item = completed(h.orchestrator.start_evolution(request));
        assert!(item.drive_file_id.is_none());
        assert_eq!(h.notifier.count("upload_failed"), 1);
        assert!(h.orchestrator.is_playing());
        assert!(h.orchestrator.next_deadline().is_some());
    }
}
