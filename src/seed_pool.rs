use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::Local;
use tracing::info;

use crate::document::Document;
use crate::error::FuzzError;
use crate::protocol::Protocol;
use crate::response::{sequence_distance, ResponseRecord};

/// A template whose responses were unlike anything seen before.
#[derive(Debug, Clone)]
pub struct Seed {
    pub artifact: PathBuf,
    pub template: Document,
    pub responses: Vec<ResponseRecord>,
}

#[derive(Debug)]
pub struct SeedPool {
    protocol: Protocol,
    dir: PathBuf,
    threshold: f64,
    seeds: VecDeque<Seed>,
    admitted: usize,
}

impl SeedPool {
    pub fn new(protocol: Protocol, dir: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            protocol,
            dir: dir.into(),
            threshold,
            seeds: VecDeque::new(),
            admitted: 0,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// A candidate is novel when its normalized alignment distance to every
    /// seed reaches the threshold. Empty response sequences never are.
    pub fn is_novel(&self, candidate: &[ResponseRecord]) -> bool {
        if candidate.is_empty() {
            return false;
        }
        self.seeds.iter().all(|seed| {
            let longest = seed.responses.len().max(candidate.len()) as f64;
            sequence_distance(&seed.responses, candidate) / longest >= self.threshold
        })
    }

    /// Persists `template` under the seed directory and appends it.
    pub fn admit(
        &mut self,
        template: &Document,
        responses: Vec<ResponseRecord>,
    ) -> Result<&Seed, FuzzError> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let artifact = self.dir.join(format!("{}-{stamp}.xml", self.admitted));
        template.save(&artifact)?;
        self.admitted += 1;
        info!(seeds = self.admitted, artifact = %artifact.display(), "new seed");
        self.seeds.push_back(Seed {
            artifact,
            template: template.clone(),
            responses,
        });
        Ok(&self.seeds[self.seeds.len() - 1])
    }

    /// Round-robin: the front seed moves to the back and is returned.
    pub fn next_seed(&mut self) -> Option<&Seed> {
        let seed = self.seeds.pop_front()?;
        self.seeds.push_back(seed);
        self.seeds.back()
    }

    /// Corpus size, the only coverage signal available without instrumentation.
    pub fn coverage(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::LpdResponse;

    fn lpd(data: &[u8]) -> ResponseRecord {
        ResponseRecord::Lpd(LpdResponse::parse(data))
    }

    fn template(value: &str) -> Document {
        Document::parse(&format!(
            r#"<Sequence><Packet delay="64 00"><Data value="{value}"/></Packet></Sequence>"#
        ))
        .unwrap()
    }

    #[test]
    fn identical_responses_are_not_novel() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SeedPool::new(Protocol::Lpd, dir.path(), 0.1);
        assert!(pool.is_novel(&[lpd(&[0])]));
        pool.admit(&template("01"), vec![lpd(&[0])]).unwrap();
        assert!(!pool.is_novel(&[lpd(&[0])]));
        assert!(pool.is_novel(&[lpd(&[1])]));
        assert!(!pool.is_novel(&[]));
    }

    #[test]
    fn admitted_candidates_are_never_admitted_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SeedPool::new(Protocol::Lpd, dir.path(), 0.1);
        let candidates = [
            vec![lpd(&[0]), lpd(b"queue empty")],
            vec![lpd(&[1])],
            vec![lpd(&[0]), lpd(b"queue empty"), lpd(&[0])],
            vec![lpd(b"printer offline")],
        ];
        for candidate in candidates {
            if pool.is_novel(&candidate) {
                pool.admit(&template("01"), candidate.clone()).unwrap();
                assert!(!pool.is_novel(&candidate));
            }
        }
        assert!(pool.coverage() >= 2);
    }

    #[test]
    fn seeds_rotate_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SeedPool::new(Protocol::Lpd, dir.path(), 0.1);
        let first = pool.admit(&template("01"), vec![lpd(&[0])]).unwrap().artifact.clone();
        pool.admit(&template("02"), vec![lpd(&[1])]).unwrap();
        assert_eq!(Document::load(&first).unwrap(), template("01"));

        assert_eq!(pool.next_seed().unwrap().template, template("01"));
        assert_eq!(pool.next_seed().unwrap().template, template("02"));
        assert_eq!(pool.next_seed().unwrap().template, template("01"));
        assert_eq!(pool.coverage(), 2);
    }
}
