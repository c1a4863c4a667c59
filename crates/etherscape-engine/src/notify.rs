//! Toast/log sink for orchestrator notices.

use std::time::Duration;

use etherscape_contracts::events::{EventPayload, EventWriter};
use serde_json::{json, Value};

use crate::dispatch::ProviderErrorKind;
use crate::media::truncate_text;
use crate::orchestrator::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    StepStarted {
        recurring: bool,
        concept: String,
        provider: String,
    },
    ProviderFallback {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },
    ProviderSwitched {
        from: String,
        to: String,
        model: String,
    },
    GenerationCompleted {
        item_id: String,
        provider: String,
        model: String,
        media_url: String,
    },
    GenerationFailed {
        kind: FailureKind,
        message: String,
    },
    RealtimeProgress {
        generation_id: u64,
        image_url: String,
    },
    EvolutionScheduled {
        next_concept: String,
        delay: Duration,
    },
    EvolutionStopped {
        reason: String,
    },
    UploadCompleted {
        item_id: String,
        file_id: String,
    },
    UploadFailed {
        item_id: String,
        message: String,
    },
}

impl Notice {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepStarted { .. } => "step_started",
            Self::ProviderFallback { .. } => "provider_fallback",
            Self::ProviderSwitched { .. } => "provider_switched",
            Self::GenerationCompleted { .. } => "generation_completed",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::RealtimeProgress { .. } => "realtime_progress",
            Self::EvolutionScheduled { .. } => "evolution_scheduled",
            Self::EvolutionStopped { .. } => "evolution_stopped",
            Self::UploadCompleted { .. } => "upload_completed",
            Self::UploadFailed { .. } => "upload_failed",
        }
    }

    pub fn level(&self) -> NoticeLevel {
        match self {
            Self::ProviderFallback { .. } | Self::UploadFailed { .. } => NoticeLevel::Warning,
            Self::GenerationFailed { .. } => NoticeLevel::Error,
            _ => NoticeLevel::Info,
        }
    }

    pub fn payload(&self) -> EventPayload {
        let value = match self {
            Self::StepStarted {
                recurring,
                concept,
                provider,
            } => json!({"recurring": recurring, "concept": concept, "provider": provider}),
            Self::ProviderFallback {
                provider,
                kind,
                message,
            } => json!({"provider": provider, "error_kind": kind.as_str(), "message": message}),
            Self::ProviderSwitched { from, to, model } => {
                json!({"from": from, "to": to, "model": model})
            }
            Self::GenerationCompleted {
                item_id,
                provider,
                model,
                media_url,
            } => json!({
                "item_id": item_id,
                "provider": provider,
                "model": model,
                "media_url": truncate_text(media_url, 120),
            }),
            Self::GenerationFailed { kind, message } => {
                json!({"failure_kind": kind.as_str(), "message": message})
            }
            Self::RealtimeProgress {
                generation_id,
                image_url,
            } => json!({"generation_id": generation_id, "image_url": truncate_text(image_url, 120)}),
            Self::EvolutionScheduled {
                next_concept,
                delay,
            } => json!({"next_concept": next_concept, "delay_ms": delay.as_millis() as u64}),
            Self::EvolutionStopped { reason } => json!({"reason": reason}),
            Self::UploadCompleted { item_id, file_id } => {
                json!({"item_id": item_id, "drive_file_id": file_id})
            }
            Self::UploadFailed { item_id, message } => {
                json!({"item_id": item_id, "message": message})
            }
        };
        let mut payload = match value {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        payload.insert("level".to_string(), Value::String(self.level().as_str().to_string()));
        payload
    }

    pub fn message(&self) -> String {
        match self {
            Self::StepStarted {
                recurring,
                concept,
                provider,
            } => {
                let mode = if *recurring { "Evolving" } else { "Generating" };
                format!("{mode} \"{concept}\" with {provider}")
            }
            Self::ProviderFallback { message, .. } => {
                format!("{message} Trying next provider.")
            }
            Self::ProviderSwitched { from, to, model } => {
                format!("Switched from {from} to {to} ({model}).")
            }
            Self::GenerationCompleted {
                item_id,
                provider,
                model,
                ..
            } => format!("Saved {item_id} from {provider}/{model}."),
            Self::GenerationFailed { message, .. } => message.clone(),
            Self::RealtimeProgress { generation_id, .. } => {
                format!("Realtime generation {generation_id} updated.")
            }
            Self::EvolutionScheduled {
                next_concept,
                delay,
            } => format!("Next: \"{next_concept}\" in {}s.", delay.as_secs()),
            Self::EvolutionStopped { reason } => format!("Evolution stopped: {reason}"),
            Self::UploadCompleted { file_id, .. } => format!("Uploaded to Drive ({file_id})."),
            Self::UploadFailed { message, .. } => format!("Drive upload failed: {message}"),
        }
    }
}

pub trait Notifier: Send {
    fn notify(&self, notice: &Notice);
}

/// Appends every notice to the session's `events.jsonl`.
pub struct EventNotifier {
    events: EventWriter,
}

impl EventNotifier {
    pub fn new(events: EventWriter) -> Self {
        Self { events }
    }
}

impl Notifier for EventNotifier {
    fn notify(&self, notice: &Notice) {
        if let Err(err) = self.events.emit(notice.event_type(), notice.payload()) {
            eprintln!("etherscape-rs warning: event write failed: {err:#}");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StderrNotifier {
    pub quiet_progress: bool,
}

impl Notifier for StderrNotifier {
    fn notify(&self, notice: &Notice) {
        if self.quiet_progress && matches!(notice, Notice::RealtimeProgress { .. }) {
            return;
        }
        eprintln!("[{}] {}", notice.level().as_str(), notice.message());
    }
}

#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<N: Notifier + 'static>(mut self, sink: N) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notice: &Notice) {
        for sink in &self.sinks {
            sink.notify(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use etherscape_contracts::events::EventWriter;
    use serde_json::Value;

    use super::{EventNotifier, FanoutNotifier, Notice, NoticeLevel, Notifier};
    use crate::dispatch::ProviderErrorKind;

    #[test]
    fn fallback_notice_is_a_warning() {
        let notice = Notice::ProviderFallback {
            provider: "gemini".to_string(),
            kind: ProviderErrorKind::Transient,
            message: "gemini request failed (429): quota".to_string(),
        };
        assert_eq!(notice.level(), NoticeLevel::Warning);
        assert_eq!(notice.event_type(), "provider_fallback");
        assert_eq!(
            notice.message(),
            "gemini request failed (429): quota Trying next provider."
        );
        assert_eq!(notice.payload()["error_kind"], "transient");
    }

    #[test]
    fn event_notifier_writes_jsonl() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let notifier = FanoutNotifier::new().with(EventNotifier::new(EventWriter::new(&path, "s-1")));
        notifier.notify(&Notice::EvolutionScheduled {
            next_concept: "Nebula tides".to_string(),
            delay: Duration::from_secs(10),
        });
        notifier.notify(&Notice::EvolutionStopped {
            reason: "user".to_string(),
        });

        let raw = fs::read_to_string(&path)?;
        let rows: Vec<Value> = raw
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["type"], "evolution_scheduled");
        assert_eq!(rows[0]["delay_ms"], 10_000);
        assert_eq!(rows[0]["session_id"], "s-1");
        assert_eq!(rows[1]["reason"], "user");
        Ok(())
    }
}
