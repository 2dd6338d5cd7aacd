mod common;

use common::{fast_config, Printer, POISON};
use spoolfuzz::minimizer::PocStep;
use spoolfuzz::session::{RoundRecord, SessionLog};
use spoolfuzz::testcase::{PacketData, TestCase};
use spoolfuzz::{MinimizeOutcome, Minimizer, Protocol};

fn request(payload: &[u8]) -> TestCase {
    TestCase {
        packets: vec![PacketData::new(payload.to_vec(), 100)],
    }
}

fn write_log(dir: &std::path::Path, payloads: &[&[u8]]) -> std::path::PathBuf {
    let mut log = SessionLog::new(Protocol::Lpd);
    for (round, payload) in payloads.iter().enumerate() {
        log.push(RoundRecord::new(round as u64, request(payload), vec![vec![0x00]], round == 0, 1));
    }
    let path = dir.join("log.json");
    log.save(&path).unwrap();
    path
}

#[tokio::test]
async fn poisoned_round_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(
        dir.path(),
        &[b"\x01lp\n", b"\x02lp\n", b"\x03lp x\n", b"\x02POISON\n", b"\x04lp\n"],
    );
    let printer = Printer::default();
    let poc_dir = dir.path().join("poc");
    let mut minimizer = Minimizer::new(
        Protocol::Lpd,
        printer.clone(),
        printer.power_switch(),
        fast_config(1),
        &poc_dir,
    );

    let outcome = minimizer.run(&log, 0, 4).await.unwrap();
    let MinimizeOutcome::Minimized { poc, steps } = outcome else {
        panic!("expected a minimized reproducer, got {outcome:?}");
    };
    assert_eq!(steps, 1);
    assert_eq!(poc, poc_dir.join("4-poc.json"));

    let saved: Vec<PocStep> = serde_json::from_str(&std::fs::read_to_string(&poc).unwrap()).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].round, 3);
    assert!(saved[0].request.packets[0].data.windows(POISON.len()).any(|w| w == POISON));

    let timing = std::fs::read_to_string(poc_dir.join("4-time.md")).unwrap();
    assert!(timing.starts_with("Stage 0 time = "));
    assert!(printer.state.lock().unwrap().restarts > 2);
}

#[tokio::test]
async fn harmless_log_does_not_reproduce() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[b"\x01lp\n", b"\x02lp\n", b"\x03lp x\n"]);
    let printer = Printer::default();
    let poc_dir = dir.path().join("poc");
    let mut minimizer = Minimizer::new(
        Protocol::Lpd,
        printer.clone(),
        printer.power_switch(),
        fast_config(1),
        &poc_dir,
    );

    assert_eq!(minimizer.run(&log, 0, -1).await.unwrap(), MinimizeOutcome::NoReproduction);
    assert!(!poc_dir.exists());
}

#[tokio::test]
async fn target_round_bounds_the_replay() {
    let dir = tempfile::tempdir().unwrap();
    let log = write_log(dir.path(), &[b"\x01lp\n", b"\x02lp\n", b"\x02POISON\n"]);
    let printer = Printer::default();
    let mut minimizer = Minimizer::new(
        Protocol::Lpd,
        printer.clone(),
        printer.power_switch(),
        fast_config(1),
        dir.path().join("poc"),
    );

    assert_eq!(minimizer.run(&log, 0, 1).await.unwrap(), MinimizeOutcome::NoReproduction);
    assert!(!printer.crashed());
}
