//! Per-job state machine.
//!
//! Runs inside the worker process. Alternates between probing the source and
//! supervising an encoder, reporting every step on the control channel:
//!
//! ```text
//! Starting -> Checking -> Offline   -> (wait) -> Checking
//!                      -> Error     -> (wait) -> Checking
//!                      -> Streaming -> (encoder died) -> Checking
//! any state -> Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::destination::{BindFailure, DestinationBinder};
use crate::domain::JobState;
use crate::monitor::{LiveSource, LiveSourceProbe, ProbeParams};
use crate::pipeline::{EncoderSettings, PipelineError, PipelineSupervisor, detect_version};
use crate::protocol::EventEmitter;
use crate::utils::duration::format_hms;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Retrying cannot help, e.g. the encoder binary is missing.
    #[error("fatal configuration error: {0}")]
    ConfigFatal(String),

    #[error("destination bind failed: {0}")]
    Bind(#[from] BindFailure),

    #[error("pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("job task crashed: {0}")]
    Crashed(String),
}

impl RuntimeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigFatal(_))
    }
}

/// Where the loop goes after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Offline,
    Error,
    Streaming,
    Stop,
}

pub struct JobRuntime {
    config: JobConfig,
    probe: Arc<dyn LiveSourceProbe>,
    binder: Arc<dyn DestinationBinder>,
    pipeline: PipelineSupervisor,
    events: EventEmitter,
    cancel: CancellationToken,
    state: JobState,
}

impl JobRuntime {
    pub fn new(
        config: JobConfig,
        probe: Arc<dyn LiveSourceProbe>,
        binder: Arc<dyn DestinationBinder>,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let pipeline = PipelineSupervisor::new(EncoderSettings::from_config(&config), events.clone());
        Self {
            config,
            probe,
            binder,
            pipeline,
            events,
            cancel,
            state: JobState::Starting,
        }
    }

    /// Replace the encoder settings derived from the config.
    pub fn with_encoder_settings(mut self, settings: EncoderSettings) -> Self {
        self.pipeline = PipelineSupervisor::new(settings, self.events.clone());
        self
    }

    /// Run until stopped or a fatal error. Always ends with `Stopped` reported.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        let result = self.run_loop().await;
        if let Err(ref e) = result {
            warn!(job_id = %self.config.source_id(), error = %e, "Job ended with error");
        }
        self.cleanup().await;
        result
    }

    async fn run_loop(&mut self) -> Result<(), RuntimeError> {
        let job_id = self.config.source_id().to_string();
        self.set_state(JobState::Starting);
        self.events.info(format!("job {} starting", job_id));

        if let Err(e) = self.preflight().await {
            self.events.error(e.to_string());
            self.set_state(JobState::Error);
            return Err(e);
        }

        let check_interval = self.config.check_interval();
        while !self.cancel.is_cancelled() {
            self.set_state(JobState::Checking);

            match self.check().await {
                Next::Offline => {
                    self.set_state(JobState::Offline);
                    self.events.info(format!(
                        "source offline, next check in {}s",
                        check_interval.as_secs()
                    ));
                    self.wait(check_interval).await;
                }
                Next::Error => {
                    self.set_state(JobState::Error);
                    self.events.info(format!("retrying in {}s", check_interval.as_secs()));
                    self.wait(check_interval).await;
                }
                Next::Streaming => self.stream().await,
                Next::Stop => break,
            }
        }

        debug!(job_id = %job_id, "Job loop finished");
        Ok(())
    }

    /// The encoder must be invocable before anything else happens.
    async fn preflight(&mut self) -> Result<(), RuntimeError> {
        let binary = self.pipeline.settings().binary_path.clone();
        match detect_version(&binary).await {
            Ok(version) => {
                info!(binary = %binary, version = %version, "Encoder found");
                self.events.debug(format!("encoder: {}", version));
                Ok(())
            }
            Err(e) => Err(RuntimeError::ConfigFatal(format!(
                "encoder '{}' is not usable: {}",
                binary, e
            ))),
        }
    }

    /// One probe, followed by a relay attempt when the source is live.
    async fn check(&mut self) -> Next {
        let source_id = self.config.source_id().to_string();
        let params = ProbeParams::from_config(&self.config);
        let probe = self.probe.clone();
        let cancel = self.cancel.clone();

        self.events.info(format!("checking source {}", source_id));
        let probed = tokio::select! {
            result = probe.probe(&source_id, &params) => result,
            _ = cancel.cancelled() => return Next::Stop,
        };

        let source = match probed {
            Ok(source) => source,
            Err(failure) if failure.is_offline() => return Next::Offline,
            Err(failure) => {
                self.events.warn(format!("probe failed: {}", failure));
                return Next::Offline;
            }
        };

        self.events.info("source is live");
        if let Some(title) = &source.title {
            self.events.title(title.clone());
        }

        let started = tokio::select! {
            result = self.stand_up(&source) => result,
            _ = cancel.cancelled() => return Next::Stop,
        };

        match started {
            Ok(pid) => {
                self.events.info(match pid {
                    Some(pid) => format!("relay started (pid {})", pid),
                    None => "relay started".to_string(),
                });
                Next::Streaming
            }
            Err(e) => {
                self.events.error(format!("failed to start relay: {}", e));
                Next::Error
            }
        }
    }

    async fn stand_up(&mut self, source: &LiveSource) -> Result<Option<u32>, RuntimeError> {
        let destination = self.binder.bind(&self.config).await?;
        self.events.debug("destination bound");
        Ok(self.pipeline.start(source, &destination).await?)
    }

    /// Heartbeat while the encoder lives. Returns when it dies or on stop.
    async fn stream(&mut self) {
        self.set_state(JobState::Streaming);

        let heartbeat = self.config.heartbeat_interval();
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                code = self.pipeline.exited() => {
                    self.on_pipeline_death(code).await;
                    return;
                }
                _ = tokio::time::sleep(heartbeat) => {
                    if !self.pipeline.is_alive() {
                        self.on_pipeline_death(None).await;
                        return;
                    }
                    self.set_state(JobState::Streaming);
                    self.report_progress();
                }
            }
        }
    }

    async fn on_pipeline_death(&mut self, code: Option<i32>) {
        let uptime = self
            .pipeline
            .handle()
            .map(|h| format_hms(h.uptime()))
            .unwrap_or_default();
        self.pipeline.stop().await;
        self.events.warn(match code {
            Some(code) => format!("relay exited with code {} after {}, re-checking source", code, uptime),
            None => format!("relay exited after {}, re-checking source", uptime),
        });
    }

    fn report_progress(&self) {
        let Some(handle) = self.pipeline.handle() else {
            return;
        };
        let mut message = format!(
            "relay (pid {}) running for {}",
            handle.pid().map_or_else(|| "?".to_string(), |pid| pid.to_string()),
            format_hms(handle.uptime())
        );
        if let Some(progress) = handle.progress() {
            message.push_str(&format!(
                ", media time {}, {:.0} kbit/s, speed {:.2}x",
                format_hms(Duration::from_secs_f64(progress.out_time_secs.max(0.0))),
                progress.bitrate_kbps,
                progress.speed
            ));
        }
        self.events.debug(message);
    }

    /// Sleep up to `total`, waking early on stop.
    async fn wait(&self, total: Duration) {
        let tick = self.config.wait_tick();
        let deadline = Instant::now() + total;

        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let step = tick.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    fn set_state(&mut self, state: JobState) {
        if let Err(e) = self.state.transition_to(state) {
            warn!(error = %e, "Unexpected state transition");
        }
        self.state = state;
        self.events.status(state);
    }

    /// Stop the encoder if one is running and report `Stopped`.
    async fn cleanup(&mut self) {
        if let Some(outcome) = self.pipeline.stop().await {
            self.events.info(if outcome.was_killed() {
                "relay killed".to_string()
            } else {
                "relay stopped".to_string()
            });
        }
        self.set_state(JobState::Stopped);
        info!(job_id = %self.config.source_id(), "Job stopped");
    }
}
