//! On-disk state of a run: the session log, crash record, progress table
//! and the directory layout that holds them.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{INPUT_FILE_NAME, REF_FILE_NAME};
use crate::document::{format_hex, parse_hex_bytes};
use crate::error::FuzzError;
use crate::protocol::Protocol;
use crate::testcase::TestCase;

/// Bytes that serialize as space separated lowercase hex (`"41 42"`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Vec<u8>);

impl Deref for HexBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex(&self.0))
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_hex(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_hex_bytes(&text).map(HexBytes).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u64,
    pub request: TestCase,
    pub response: Vec<HexBytes>,
    /// The device was power cycled right before this round.
    pub restarted: bool,
    pub survived: bool,
    pub healthy: bool,
    /// Corpus size after the round.
    pub coverage: usize,
}

impl RoundRecord {
    pub fn new(round: u64, request: TestCase, response: Vec<Vec<u8>>, restarted: bool, coverage: usize) -> Self {
        Self {
            round,
            request,
            response: response.into_iter().map(HexBytes).collect(),
            restarted,
            survived: true,
            healthy: true,
            coverage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub protocol: Protocol,
    pub rounds: Vec<RoundRecord>,
}

impl SessionLog {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            rounds: Vec::new(),
        }
    }

    pub fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn last_mut(&mut self) -> Option<&mut RoundRecord> {
        self.rounds.last_mut()
    }

    pub fn save(&self, path: &Path) -> Result<(), FuzzError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| FuzzError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self, FuzzError> {
        let text = fs::read_to_string(path).map_err(|e| FuzzError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// `<log_dir>/<ip>-<port>-<timestamp>/`
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn create(log_dir: &Path, ip: &str, port: u16) -> Result<Self, FuzzError> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        Self::open(log_dir.join(format!("{ip}-{port}-{stamp}")))
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, FuzzError> {
        let dir = Self { root: root.into() };
        let seeds = dir.seed_pool_dir();
        fs::create_dir_all(&seeds).map_err(|e| FuzzError::io(seeds, e))?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input(&self) -> PathBuf {
        self.root.join(INPUT_FILE_NAME)
    }

    pub fn reference(&self) -> PathBuf {
        self.root.join(REF_FILE_NAME)
    }

    pub fn seed_pool_dir(&self) -> PathBuf {
        self.root.join("seedpool")
    }

    pub fn session_log(&self) -> PathBuf {
        self.root.join("log.json")
    }

    pub fn crash_log(&self) -> PathBuf {
        self.root.join("crash_log.txt")
    }

    pub fn progress_log(&self) -> PathBuf {
        self.root.join("fuzz_log.txt")
    }
}

fn append(path: &Path, line: &str) -> Result<(), FuzzError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FuzzError::io(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| FuzzError::io(path, e))
}

pub fn append_crash(path: &Path, round: u64, message: &str) -> Result<(), FuzzError> {
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    append(path, &format!("[{stamp}] round {round}: {message}\n"))
}

pub fn write_progress_header(path: &Path) -> Result<(), FuzzError> {
    let header = format!(
        "{:<20}{:<20}{:<20}{:<20}{:<20}\n",
        "Time", "Round", "Mutate stage", "Coverage", "Crash found"
    );
    fs::write(path, header).map_err(|e| FuzzError::io(path, e))
}

pub fn append_progress(
    path: &Path,
    elapsed: Duration,
    round: u64,
    stage: u8,
    coverage: usize,
    crashes: u64,
) -> Result<(), FuzzError> {
    append(
        path,
        &format!(
            "{:<20}{:<20}{:<20}{:<20}{:<20}\n",
            format_elapsed(elapsed),
            round,
            stage,
            coverage,
            crashes
        ),
    )
}

/// `HH:MM:SS`, hours keep counting past a day.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::PacketData;

    #[test]
    fn session_log_keeps_hex_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = SessionLog::new(Protocol::Lpd);
        let request = TestCase {
            packets: vec![PacketData::new(vec![0x41, 0x42], 100)],
        };
        log.push(RoundRecord::new(0, request, vec![vec![0x00]], true, 1));
        log.last_mut().unwrap().healthy = false;
        log.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"41 42\""), "{text}");
        assert!(text.contains("\"lpd\""));
        assert_eq!(SessionLog::load(&path).unwrap(), log);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let parsed: Result<HexBytes, _> = serde_json::from_str("\"zz\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn run_dir_layout_and_logs() {
        let base = tempfile::tempdir().unwrap();
        let run = RunDir::create(base.path(), "127.0.0.1", 631).unwrap();
        assert!(run.seed_pool_dir().is_dir());
        let name = run.root().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("127.0.0.1-631-"));

        write_progress_header(&run.progress_log()).unwrap();
        append_progress(&run.progress_log(), Duration::from_secs(3723), 12, 2, 4, 1).unwrap();
        let progress = std::fs::read_to_string(run.progress_log()).unwrap();
        assert_eq!(progress.lines().count(), 2);
        assert!(progress.lines().nth(1).unwrap().starts_with("01:02:03"));

        append_crash(&run.crash_log(), 7, "no response").unwrap();
        append_crash(&run.crash_log(), 9, "health check failed").unwrap();
        let crashes = std::fs::read_to_string(run.crash_log()).unwrap();
        assert!(crashes.contains("round 7: no response"));
        assert_eq!(crashes.lines().count(), 2);
    }
}
