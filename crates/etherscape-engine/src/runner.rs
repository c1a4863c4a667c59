//! Actor wrapper: owns the [`Orchestrator`] on one thread and feeds it
//! commands, realtime updates and timer expiries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use etherscape_contracts::settings::GenerationSettings;

use crate::orchestrator::{Orchestrator, StepOutcome};
use crate::realtime::{RealtimeSink, RealtimeUpdate};

#[derive(Debug, Clone)]
pub enum Command {
    Start(GenerationSettings),
    GenerateOnce(GenerationSettings),
    Stop,
    Realtime(RealtimeUpdate),
    Shutdown,
}

pub fn command_channel() -> (Sender<Command>, Receiver<Command>) {
    mpsc::channel()
}

/// Routes realtime updates back into the runner's command queue.
pub fn realtime_sink(tx: Sender<Command>) -> RealtimeSink {
    Arc::new(move |update: RealtimeUpdate| {
        let _ = tx.send(Command::Realtime(update));
    })
}

pub struct RunnerHandle {
    tx: Sender<Command>,
    playing: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn start(&self, settings: GenerationSettings) -> Result<()> {
        self.send(Command::Start(settings))
    }

    pub fn generate_once(&self, settings: GenerationSettings) -> Result<()> {
        self.send(Command::GenerateOnce(settings))
    }

    /// Flips the playing flag before queueing, so a step blocked in a provider
    /// call will not reschedule.
    pub fn stop(&self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        self.send(Command::Stop)
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);
        self.join()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("orchestrator runner is not running"))
    }

    fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| anyhow!("orchestrator runner panicked"))?;
        }
        Ok(())
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = self.join();
        }
    }
}

pub struct OrchestratorRunner;

impl OrchestratorRunner {
    pub fn spawn(orchestrator: Orchestrator, outcomes: Sender<StepOutcome>) -> Result<RunnerHandle> {
        let (tx, rx) = command_channel();
        Self::spawn_with(orchestrator, tx, rx, outcomes)
    }

    /// Use when the realtime channel was built with [`realtime_sink`] on `tx`.
    pub fn spawn_with(
        orchestrator: Orchestrator,
        tx: Sender<Command>,
        rx: Receiver<Command>,
        outcomes: Sender<StepOutcome>,
    ) -> Result<RunnerHandle> {
        let playing = orchestrator.playing_flag();
        let thread = thread::Builder::new()
            .name("etherscape-orchestrator".to_string())
            .spawn(move || run_loop(orchestrator, rx, outcomes))
            .context("orchestrator thread spawn failed")?;
        Ok(RunnerHandle {
            tx,
            playing,
            thread: Some(thread),
        })
    }
}

fn run_loop(mut orchestrator: Orchestrator, rx: Receiver<Command>, outcomes: Sender<StepOutcome>) {
    loop {
        let command = match orchestrator.next_deadline() {
            Some(due) => match rx.recv_timeout(due.saturating_duration_since(Instant::now())) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        let outcome = match command {
            None => orchestrator.run_due(Instant::now()),
            Some(Command::Start(settings)) => Some(orchestrator.start_evolution(settings)),
            Some(Command::GenerateOnce(settings)) => {
                Some(orchestrator.perform_single_generation(settings))
            }
            Some(Command::Stop) => {
                orchestrator.stop_evolution();
                None
            }
            Some(Command::Realtime(update)) => orchestrator.handle_realtime(update),
            Some(Command::Shutdown) => {
                orchestrator.stop_evolution();
                break;
            }
        };
        if let Some(outcome) = outcome {
            let _ = outcomes.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::time::Duration;

    use etherscape_contracts::events::EventWriter;
    use etherscape_contracts::history::JsonHistoryStore;
    use etherscape_contracts::providers::DRYRUN;
    use etherscape_contracts::settings::GenerationSettings;

    use super::{command_channel, realtime_sink, OrchestratorRunner};
    use crate::config::EngineEnv;
    use crate::dispatch::{PollPolicy, ProviderDispatch};
    use crate::notify::EventNotifier;
    use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, StepOutcome};
    use crate::realtime::RealtimeChannel;
    use crate::theme::DryrunThemeGenerator;

    const WAIT: Duration = Duration::from_secs(5);

    fn dryrun_orchestrator(delay: Duration, tx: std::sync::mpsc::Sender<super::Command>) -> Orchestrator {
        let env = EngineEnv::default();
        let collaborators = Collaborators {
            theme: Box::new(DryrunThemeGenerator),
            dispatcher: Box::new(ProviderDispatch::from_env(&env, PollPolicy::default())),
            realtime: Box::new(RealtimeChannel::new("ws://127.0.0.1:9".to_string(), realtime_sink(tx))),
            history: Box::new(JsonHistoryStore::in_memory(10)),
            uploader: None,
            notifier: Box::new(EventNotifier::new(EventWriter::detached("runner-test"))),
        };
        let config = OrchestratorConfig {
            evolution_delay: delay,
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(config, collaborators)
    }

    fn dryrun_settings() -> GenerationSettings {
        let mut settings = GenerationSettings::new("Cosmic jellyfish ballet", "Impressionistic", DRYRUN, "dryrun-image-1");
        settings.aspect_ratio = "1:1".to_string();
        settings
    }

    #[test]
    fn generate_once_reports_completion() -> anyhow::Result<()> {
        let (tx, rx) = command_channel();
        let (outcomes_tx, outcomes) = mpsc::channel();
        let handle = OrchestratorRunner::spawn_with(
            dryrun_orchestrator(Duration::from_secs(10), tx.clone()),
            tx,
            rx,
            outcomes_tx,
        )?;
        handle.generate_once(dryrun_settings())?;
        match outcomes.recv_timeout(WAIT)? {
            StepOutcome::Completed(item) => {
                assert_eq!(item.provider_id, DRYRUN);
                assert!(item.media_url.starts_with("data:image/png;base64,"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        handle.shutdown()
    }

    #[test]
    fn timer_fires_until_stopped() -> anyhow::Result<()> {
        let (tx, rx) = command_channel();
        let (outcomes_tx, outcomes) = mpsc::channel();
        let handle = OrchestratorRunner::spawn_with(
            dryrun_orchestrator(Duration::from_millis(30), tx.clone()),
            tx,
            rx,
            outcomes_tx,
        )?;
        handle.start(dryrun_settings())?;

        let first = outcomes.recv_timeout(WAIT)?;
        let second = outcomes.recv_timeout(WAIT)?;
        let concept = |outcome: &StepOutcome| match outcome {
            StepOutcome::Completed(item) => item.concept.clone(),
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(concept(&first), "Cosmic jellyfish ballet");
        assert_ne!(concept(&second), concept(&first));

        handle.stop()?;
        while outcomes.recv_timeout(Duration::from_millis(100)).is_ok() {}
        assert_eq!(
            outcomes.recv_timeout(Duration::from_millis(200)).err(),
            Some(RecvTimeoutError::Timeout)
        );
        handle.shutdown()
    }
}
