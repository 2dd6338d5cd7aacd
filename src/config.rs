use std::time::Duration;

pub const ARITH_MAX: i64 = 35;
pub const MIN_DELAY: u32 = 100;
pub const MAX_DELAY: u32 = 2000;
/// Delay value that tells the sender to move on without sleeping.
pub const SKIP_DELAY: u32 = MIN_DELAY - 1;
/// Delay value that tells the sender to drop the remaining packets.
pub const ABORT_DELAY: u32 = MAX_DELAY + 1;
pub const OVERFLOW_CAP: usize = 1025;
pub const STAGE_UPGRADE_ROUND: u64 = 100;
pub const MUTATION_TIMES: u32 = 10;
pub const MAX_MUTATION_COUNT: usize = 6;
pub const NOVELTY_THRESHOLD: f64 = 0.1;

pub const INPUT_FILE_NAME: &str = "input.xml";
pub const REF_FILE_NAME: &str = "reference.xml";

#[derive(Debug, Clone)]
pub struct FuzzConfig {
    pub seed: u64,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    /// How long the receiver may keep reading once every packet is sent.
    pub recv_grace: Duration,
    pub exchange_pause: Duration,
    pub mutation_times: u32,
    pub max_mutations: usize,
    pub stage_upgrade_rounds: u64,
    pub novelty_threshold: f64,
    pub survival_attempts: u32,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub restart_probe_interval: Duration,
    pub flush_interval: Duration,
}

impl FuzzConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            connect_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(3),
            recv_grace: Duration::from_secs(5),
            exchange_pause: Duration::from_millis(500),
            mutation_times: MUTATION_TIMES,
            max_mutations: MAX_MUTATION_COUNT,
            stage_upgrade_rounds: STAGE_UPGRADE_ROUND,
            novelty_threshold: NOVELTY_THRESHOLD,
            survival_attempts: 3,
            health_attempts: 5,
            health_interval: Duration::from_secs(1),
            restart_probe_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(300),
        }
    }
}
