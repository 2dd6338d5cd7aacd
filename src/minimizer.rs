//! Replays a recorded session to find the round that broke the target,
//! then shrinks the replay to the rounds it actually needs.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::FuzzConfig;
use crate::device::DeviceControl;
use crate::error::FuzzError;
use crate::fuzzer::{is_healthy, send_and_receive, survives};
use crate::protocol::Protocol;
use crate::session::SessionLog;
use crate::testcase::TestCase;
use crate::transport::Transport;

/// One request of a replay. Interleaved benign requests carry round 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PocStep {
    pub round: u64,
    pub request: TestCase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub origin: TestCase,
    pub steps: Vec<PocStep>,
}

impl ReplayPlan {
    /// Selects the rounds to replay: rounds before `start_round` are
    /// skipped, a restarted round discards everything before it, and the
    /// replay ends at `target_round` (a negative target keeps every round).
    pub fn from_log(
        log: &SessionLog,
        start_round: u64,
        target_round: i64,
    ) -> Result<Self, FuzzError> {
        let origin = log.rounds.first().ok_or(FuzzError::EmptyLog)?.request.clone();
        let mut steps = Vec::new();
        for record in &log.rounds {
            if record.round < start_round {
                continue;
            }
            if record.restarted {
                steps.clear();
            }
            steps.push(PocStep {
                round: record.round,
                request: record.request.clone(),
            });
            if target_round >= 0 && record.round >= target_round as u64 {
                break;
            }
        }
        Ok(Self { origin, steps })
    }
}

/// Decides whether a candidate replay still breaks the target.
pub trait ReplayOracle {
    fn reproduces(&mut self, steps: &[&PocStep]) -> impl Future<Output = bool>;
}

/// Removes every contiguous chunk of `steps` whose absence still
/// reproduces the failure. The last step is never a removal candidate.
pub async fn delta_debug<O: ReplayOracle>(
    oracle: &mut O,
    mut steps: Vec<PocStep>,
) -> Vec<PocStep> {
    let mut chunk = steps.len() / 2;
    while chunk > 0 {
        let mut start = 0;
        while start + chunk < steps.len() {
            let complement: Vec<&PocStep> = steps[..start]
                .iter()
                .chain(&steps[start + chunk..])
                .collect();
            if oracle.reproduces(&complement).await {
                debug!(start, chunk, remaining = steps.len() - chunk, "chunk is redundant");
                steps.drain(start..start + chunk);
                start = 0;
            } else {
                start += chunk;
            }
        }
        chunk /= 2;
    }
    steps
}

#[derive(Debug, Clone, PartialEq)]
pub enum MinimizeOutcome {
    /// Replaying the log left the target healthy.
    NoReproduction,
    /// The minimized replay no longer breaks the target.
    NotReproducible,
    Minimized { poc: PathBuf, steps: usize },
}

pub struct Minimizer<T: Transport, D: DeviceControl> {
    protocol: Protocol,
    transport: T,
    device: D,
    config: FuzzConfig,
    poc_dir: PathBuf,
}

impl<T: Transport, D: DeviceControl> Minimizer<T, D> {
    pub fn new(
        protocol: Protocol,
        transport: T,
        device: D,
        config: FuzzConfig,
        poc_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            protocol,
            transport,
            device,
            config,
            poc_dir: poc_dir.into(),
        }
    }

    pub async fn run(
        &mut self,
        log_path: &Path,
        start_round: u64,
        target_round: i64,
    ) -> Result<MinimizeOutcome, FuzzError> {
        let log = SessionLog::load(log_path)?;
        if log.protocol != self.protocol {
            warn!(
                recorded = %log.protocol,
                selected = %self.protocol,
                "session log is from another protocol"
            );
        }
        let plan = ReplayPlan::from_log(&log, start_round, target_round)?;
        let origin = &plan.origin;
        info!(rounds = plan.steps.len(), "replay plan ready");
        self.restart_until_healthy(origin).await?;

        let started = Instant::now();
        info!("========== STAGE 0 ==========");
        let Some(end) = self.find_boundary(&plan.steps, origin).await else {
            info!("no crash found");
            return Ok(MinimizeOutcome::NoReproduction);
        };
        let stage0 = started.elapsed();
        info!(round = plan.steps[end].round, elapsed = ?stage0, "crash boundary found");
        self.restart_until_healthy(origin).await?;

        info!("========== STAGE 1 ==========");
        let origin_step = PocStep {
            round: 0,
            request: origin.clone(),
        };
        let mut candidates = Vec::with_capacity(end * 2 + 1);
        for (i, step) in plan.steps[..=end].iter().enumerate() {
            if i > 0 {
                candidates.push(origin_step.clone());
            }
            candidates.push(step.clone());
        }
        let mut oracle = LiveOracle {
            minimizer: self,
            origin,
        };
        let steps = delta_debug(&mut oracle, candidates).await;
        let stage1 = started.elapsed() - stage0;
        info!(steps = steps.len(), elapsed = ?stage1, "minimized");

        let verify_started = Instant::now();
        let refs: Vec<&PocStep> = steps.iter().collect();
        if !self.replay(&refs, origin).await {
            info!("PoC can't crash the target");
            return Ok(MinimizeOutcome::NotReproducible);
        }
        let verify = verify_started.elapsed();

        let poc = self.save_poc(&steps, target_round, [stage0, stage1, verify])?;
        info!(path = %poc.display(), "PoC saved");
        Ok(MinimizeOutcome::Minimized {
            poc,
            steps: steps.len(),
        })
    }

    async fn send(&mut self, step: &PocStep) {
        let sent = send_and_receive(
            &self.transport,
            &mut self.device,
            self.protocol,
            &step.request,
            &self.config,
        )
        .await;
        if let Err(err) = sent {
            debug!(round = step.round, %err, "replayed request failed");
        }
    }

    async fn target_is_broken(&mut self, origin: &TestCase) -> bool {
        let survived = survives(
            &self.transport,
            &mut self.device,
            self.protocol,
            origin,
            &self.config,
        )
        .await;
        !(survived && is_healthy(&mut self.device, &self.config).await)
    }

    /// Index of the first step after which the target stops surviving.
    async fn find_boundary(&mut self, steps: &[PocStep], origin: &TestCase) -> Option<usize> {
        for (i, step) in steps.iter().enumerate() {
            debug!(round = step.round, "replaying");
            self.send(step).await;
            if self.target_is_broken(origin).await {
                return Some(i);
            }
        }
        None
    }

    /// Replays `steps` and reports whether the target is broken afterwards.
    async fn replay(&mut self, steps: &[&PocStep], origin: &TestCase) -> bool {
        for step in steps {
            self.send(step).await;
        }
        self.target_is_broken(origin).await
    }

    /// Power cycles the device until the benign request is answered again.
    async fn restart_until_healthy(&mut self, origin: &TestCase) -> Result<(), FuzzError> {
        loop {
            let restarted = self.device.restart().await;
            if !restarted {
                warn!("restart failed");
            }
            for attempt in 1..=self.config.survival_attempts {
                let answered = send_and_receive(
                    &self.transport,
                    &mut self.device,
                    self.protocol,
                    origin,
                    &self.config,
                )
                .await;
                match answered {
                    Ok(chunks) if self.protocol.survived(&self.protocol.decode(&chunks)) => {
                        debug!(attempt, "target is back");
                        return Ok(());
                    }
                    Ok(_) => debug!(attempt, "target not answering yet"),
                    Err(err) => debug!(attempt, %err, "target not reachable yet"),
                }
                sleep(self.config.restart_probe_interval).await;
            }
            // Without a working power switch nothing will bring the target back.
            if !restarted {
                return Err(FuzzError::Restart);
            }
        }
    }

    fn save_poc(
        &self,
        steps: &[PocStep],
        target_round: i64,
        times: [Duration; 3],
    ) -> Result<PathBuf, FuzzError> {
        fs::create_dir_all(&self.poc_dir).map_err(|e| FuzzError::io(&self.poc_dir, e))?;
        let poc = self.poc_dir.join(format!("{target_round}-poc.json"));
        let json = serde_json::to_string_pretty(steps)?;
        fs::write(&poc, json).map_err(|e| FuzzError::io(&poc, e))?;

        let timing = self.poc_dir.join(format!("{target_round}-time.md"));
        let [stage0, stage1, verify] = times;
        let text = format!(
            "Stage 0 time = {:.3}s\nStage 1 time = {:.3}s\nPoC time = {:.3}s\n",
            stage0.as_secs_f64(),
            stage1.as_secs_f64(),
            verify.as_secs_f64()
        );
        fs::write(&timing, text).map_err(|e| FuzzError::io(&timing, e))?;
        Ok(poc)
    }
}

/// Replays candidates against the live target, restarting it after each trial.
struct LiveOracle<'a, T: Transport, D: DeviceControl> {
    minimizer: &'a mut Minimizer<T, D>,
    origin: &'a TestCase,
}

impl<T: Transport, D: DeviceControl> ReplayOracle for LiveOracle<'_, T, D> {
    async fn reproduces(&mut self, steps: &[&PocStep]) -> bool {
        let broken = self.minimizer.replay(steps, self.origin).await;
        if let Err(err) = self.minimizer.restart_until_healthy(self.origin).await {
            warn!(%err, "target did not come back after a trial");
        }
        broken
    }
}
