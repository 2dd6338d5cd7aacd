use crate::{ExecutionResult, FuzzTarget, FuzzingStats};
use rand::Rng;
use std::fmt;
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FuzzConfig;
use crate::device::{DeviceControl, HealthStatus};
use crate::document::Document;
use crate::error::{FuzzError, TransportError};
use crate::mutations::{DocumentMutator, Mutator};
use crate::protocol::Protocol;
use crate::reference::Reference;
use crate::seed_pool::SeedPool;
use crate::session::{
    append_crash, append_progress, write_progress_header, RoundRecord, RunDir, SessionLog,
};
use crate::testcase::TestCase;
use crate::transport::{exchange, Transport};

/// Mutation operator sets, widened as the target stops producing new seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Leaf,
    Timing,
    Structure,
}

impl Stage {
    const ALL: [Stage; 3] = [Stage::Leaf, Stage::Timing, Stage::Structure];

    pub fn number(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.number())
    }
}

pub struct PrinterFuzzer<T: Transport, D: DeviceControl> {
    protocol: Protocol,
    transport: T,
    device: D,
    config: FuzzConfig,
    run_dir: RunDir,
    mutator: DocumentMutator,
    origin: Document,
    origin_case: TestCase,
    current: Document,
    pool: SeedPool,
    log: SessionLog,
    stage: Stage,
    round: u64,
    budget: u32,
    last_seed_round: u64,
    stage_since: u64,
    last_restart_round: u64,
    need_restart: bool,
    crashes: u64,
    started: Instant,
    last_flush: Option<Instant>,
    initialized: bool,
}

impl<T: Transport, D: DeviceControl> PrinterFuzzer<T, D> {
    pub fn new(
        protocol: Protocol,
        transport: T,
        device: D,
        template: Document,
        reference: Option<Reference>,
        run_dir: RunDir,
        config: FuzzConfig,
    ) -> Result<Self, FuzzError> {
        let origin_case = TestCase::from_document(&template)?;
        let pool = SeedPool::new(protocol, run_dir.seed_pool_dir(), config.novelty_threshold);
        Ok(Self {
            protocol,
            transport,
            device,
            mutator: DocumentMutator::new(config.seed, reference),
            run_dir,
            current: template.clone(),
            origin: template,
            origin_case,
            pool,
            log: SessionLog::new(protocol),
            stage: Stage::Leaf,
            round: 0,
            budget: config.mutation_times,
            last_seed_round: 0,
            stage_since: 0,
            last_restart_round: 0,
            need_restart: false,
            crashes: 0,
            started: Instant::now(),
            last_flush: None,
            initialized: false,
            config,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    pub fn stats(&self) -> FuzzingStats {
        FuzzingStats {
            rounds: self.round.saturating_sub(1),
            seeds: self.pool.coverage(),
            crashes: self.crashes,
            stage: self.stage,
        }
    }

    /// Exchanges the unmodified template once and makes its answer seed 0.
    pub async fn init(&mut self) -> Result<(), FuzzError> {
        info!(protocol = %self.protocol, packets = self.origin_case.len(), "initializing fuzzer");
        let restarted = self.device.restart().await;
        if !restarted {
            warn!("device was not restarted, starting from its current state");
        }

        let chunks = send_and_receive(
            &self.transport,
            &mut self.device,
            self.protocol,
            &self.origin_case,
            &self.config,
        )
        .await
        .map_err(|err| FuzzError::Init(err.to_string()))?;
        let responses = self.protocol.decode(&chunks);
        debug!(responses = responses.len(), "origin answered");

        self.pool.admit(&self.origin, responses)?;
        self.log.push(RoundRecord::new(
            0,
            self.origin_case.clone(),
            chunks,
            restarted,
            self.pool.coverage(),
        ));
        write_progress_header(&self.run_dir.progress_log())?;
        self.origin.save(&self.run_dir.input())?;

        self.current = self.origin.clone();
        self.round = 1;
        self.budget = self.config.mutation_times;
        self.started = Instant::now();
        self.initialized = true;
        info!("fuzzer initialized");
        Ok(())
    }

    /// Runs one round of the current seed cycle.
    pub async fn fuzz_round(&mut self) -> Result<ExecutionResult, FuzzError> {
        if self.budget == 0 {
            self.rotate()?;
        }
        self.budget -= 1;
        self.escalate();

        let round = self.round;
        self.round += 1;
        let sampled = self.sample_stage();

        let mut candidate = self.current.clone();
        if !self.mutate_working(&mut candidate, sampled) || !self.mutator.is_valid(&candidate) {
            debug!(round, stage = %sampled, "no usable mutation, ending seed cycle");
            self.budget = 0;
            return Ok(ExecutionResult::Skipped);
        }
        let case = match TestCase::from_document(&candidate) {
            Ok(case) => case,
            Err(err) => {
                warn!(round, %err, "mutated template does not assemble");
                self.budget = 0;
                return Ok(ExecutionResult::Skipped);
            }
        };
        self.current = candidate;
        info!(round, stage = %sampled, packets = case.len(), "round");

        let restarted = self.restart_if_due(round).await?;
        let chunks = match send_and_receive(
            &self.transport,
            &mut self.device,
            self.protocol,
            &case,
            &self.config,
        )
        .await
        {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(round, %err, "exchange failed, treating as no response");
                Vec::new()
            }
        };

        let responses = self.protocol.decode(&chunks);
        let mut result = ExecutionResult::Invalid;
        if !self.protocol.is_valid(&responses) {
            debug!(round, "target rejected the request, ending seed cycle");
            self.budget = 0;
        } else if self.pool.is_novel(&responses) {
            self.pool.admit(&self.current, responses)?;
            self.last_seed_round = round;
            result = ExecutionResult::Ok { novel: true };
        } else {
            result = ExecutionResult::Ok { novel: false };
        }
        self.log
            .push(RoundRecord::new(round, case, chunks, restarted, self.pool.coverage()));

        let survived = survives(
            &self.transport,
            &mut self.device,
            self.protocol,
            &self.origin_case,
            &self.config,
        )
        .await;
        if !survived {
            self.crash_handler(round, "Survival test failed")?;
            result = ExecutionResult::Crash("Survival test failed".into());
        }
        let healthy = is_healthy(&mut self.device, &self.config).await;
        if !healthy {
            self.crash_handler(round, "Monitor test failed")?;
            result = ExecutionResult::Crash("Monitor test failed".into());
        }
        if let Some(record) = self.log.last_mut() {
            record.survived = survived;
            record.healthy = healthy;
        }

        self.flush(false)?;
        Ok(result)
    }

    fn sample_stage(&mut self) -> Stage {
        let top = self.stage as usize;
        Stage::ALL[self.mutator.rng_mut().gen_range(0..=top)]
    }

    /// Applies one to `max_mutations` operators of `stage` to `doc`.
    fn mutate_working(&mut self, doc: &mut Document, stage: Stage) -> bool {
        let count = self.mutator.rng_mut().gen_range(1..=self.config.max_mutations.max(1));
        let mut changed = false;
        for _ in 0..count {
            changed |= match stage {
                Stage::Leaf => self.mutator.mutate_leaf(doc, &[]),
                Stage::Timing => {
                    let at = self.mutator.select_node(doc);
                    if at.is_empty() {
                        match self.mutator.select_child(doc, &at) {
                            Some(packet) => self.mutator.mutate_delay(doc, &packet),
                            None => false,
                        }
                    } else {
                        self.mutator.mutate_structure(doc, &at)
                    }
                }
                Stage::Structure => {
                    let at = self.mutator.select_node(doc);
                    self.mutator.mutate_structure(doc, &at)
                }
            };
        }
        changed
    }

    fn escalate(&mut self) {
        let upgrade = self.config.stage_upgrade_rounds;
        let completed = self.round.saturating_sub(1);
        match self.stage {
            Stage::Leaf if completed.saturating_sub(self.last_seed_round) >= upgrade => {
                self.stage = Stage::Timing;
                self.stage_since = completed;
            }
            Stage::Timing
                if completed.saturating_sub(self.last_seed_round.max(self.stage_since))
                    >= upgrade * 2 =>
            {
                self.stage = Stage::Structure;
            }
            _ => return,
        }
        info!(round = self.round, stage = %self.stage, "escalating mutation stage");
    }

    /// Moves to the next seed and checkpoints it as the working template.
    fn rotate(&mut self) -> Result<(), FuzzError> {
        if let Some(seed) = self.pool.next_seed() {
            debug!(artifact = %seed.artifact.display(), "next seed");
            self.current = seed.template.clone();
        }
        self.current.save(&self.run_dir.input())?;
        self.budget = self.config.mutation_times;
        Ok(())
    }

    async fn restart_if_due(&mut self, round: u64) -> Result<bool, FuzzError> {
        if self.need_restart {
            if !self.device.restart().await {
                error!(round, "restart after crash failed");
                return Err(FuzzError::Restart);
            }
        } else {
            let due = self
                .device
                .restart_interval()
                .is_some_and(|interval| interval > 0 && round - self.last_restart_round >= interval);
            if !due {
                return Ok(false);
            }
            if !self.device.restart().await {
                warn!(round, "scheduled restart failed");
                return Ok(false);
            }
        }
        self.need_restart = false;
        self.last_restart_round = round;
        Ok(true)
    }

    fn crash_handler(&mut self, round: u64, message: &str) -> Result<(), FuzzError> {
        if !self.need_restart {
            self.crashes += 1;
        }
        append_crash(&self.run_dir.crash_log(), round, message)?;
        self.need_restart = true;
        self.budget = 0;
        error!(round, crashes = self.crashes, "!!!!!!!! {message} !!!!!!!!");
        Ok(())
    }

    /// Persists the session log and a progress row once the flush interval
    /// has passed, or unconditionally when `force` is set.
    fn flush(&mut self, force: bool) -> Result<(), FuzzError> {
        let due = self
            .last_flush
            .map_or(true, |at| at.elapsed() >= self.config.flush_interval);
        if !force && !due {
            return Ok(());
        }
        self.log.save(&self.run_dir.session_log())?;
        append_progress(
            &self.run_dir.progress_log(),
            self.started.elapsed(),
            self.round.saturating_sub(1),
            self.stage.number(),
            self.pool.coverage(),
            self.crashes,
        )?;
        self.current.save(&self.run_dir.input())?;
        self.last_flush = Some(Instant::now());
        debug!(rounds = self.log.rounds.len(), "session log saved");
        Ok(())
    }

    /// Fuzzes until `shutdown` fires or a fatal error occurs. The session
    /// log is flushed either way.
    pub async fn run_until(&mut self, shutdown: CancellationToken) -> Result<FuzzingStats, FuzzError> {
        if !self.initialized {
            self.init().await?;
        }
        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(round = self.round, "shutdown requested");
                    break;
                }
                outcome = self.fuzz_round() => outcome,
            };
            if let Err(err) = outcome {
                if let Err(flush_err) = self.flush(true) {
                    warn!(%flush_err, "final flush failed");
                }
                return Err(err);
            }
        }
        self.flush(true)?;
        let stats = self.stats();
        info!(rounds = stats.rounds, seeds = stats.seeds, crashes = stats.crashes, "fuzzing finished");
        Ok(stats)
    }
}

impl<T: Transport, D: DeviceControl> FuzzTarget for PrinterFuzzer<T, D> {
    async fn init(&mut self) -> Result<(), FuzzError> {
        PrinterFuzzer::init(self).await
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<FuzzingStats, FuzzError> {
        self.run_until(shutdown).await
    }
}

/// One exchange followed by the device cleanup and the inter-exchange pause.
pub(crate) async fn send_and_receive<T: Transport, D: DeviceControl>(
    transport: &T,
    device: &mut D,
    protocol: Protocol,
    case: &TestCase,
    config: &FuzzConfig,
) -> Result<Vec<Vec<u8>>, TransportError> {
    let exchanged = exchange(transport, protocol.exchange_mode(), case, config).await;
    device.cleanup().await;
    sleep(config.exchange_pause).await;
    Ok(exchanged?
        .iter()
        .map(|chunk| protocol.filter_response(chunk))
        .collect())
}

/// Resends the benign request until the target answers it meaningfully.
pub(crate) async fn survives<T: Transport, D: DeviceControl>(
    transport: &T,
    device: &mut D,
    protocol: Protocol,
    origin: &TestCase,
    config: &FuzzConfig,
) -> bool {
    for attempt in 1..=config.survival_attempts {
        match send_and_receive(transport, device, protocol, origin, config).await {
            Ok(chunks) if protocol.survived(&protocol.decode(&chunks)) => {
                debug!(attempt, "survival test passed");
                return true;
            }
            Ok(_) => warn!(attempt, "survival test got no meaningful answer"),
            Err(err) => warn!(attempt, %err, "survival test error"),
        }
    }
    false
}

/// Polls the device monitors until one verdict is not degraded.
pub(crate) async fn is_healthy<D: DeviceControl>(device: &mut D, config: &FuzzConfig) -> bool {
    for attempt in 1..=config.health_attempts {
        match device.health_check().await {
            HealthStatus::Ok => return true,
            HealthStatus::Failed => return false,
            HealthStatus::Degraded => {
                debug!(attempt, "health check inconclusive");
                sleep(config.health_interval).await;
            }
        }
    }
    false
}
