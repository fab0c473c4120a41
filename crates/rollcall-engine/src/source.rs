//! Seam between the engine and wherever enrollment data lives.
//!
//! The engine only ever asks for "all enrolled identities of a cohort";
//! storage details (filesystem, database, object store) stay behind
//! [`TrainingSource`].

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cohort '{0}' not found")]
    CohortNotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// One enrolled identity: its label and the encoded sample block.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    pub identity: String,
    pub block: Vec<u8>,
}

pub trait TrainingSource: Send + Sync {
    /// All enrolled identities of a cohort. An existing but empty cohort is
    /// `Ok(vec![])`; whether an unknown cohort is an error is up to the
    /// source.
    fn load_cohort(&self, cohort: &str) -> Result<Vec<EnrolledIdentity>, SourceError>;
}

/// In-memory source for tests and for callers that manage storage themselves.
#[derive(Debug, Default)]
pub struct MemorySource {
    cohorts: HashMap<String, Vec<EnrolledIdentity>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cohort: impl Into<String>, identity: impl Into<String>, block: Vec<u8>) {
        self.cohorts
            .entry(cohort.into())
            .or_default()
            .push(EnrolledIdentity { identity: identity.into(), block });
    }
}

impl TrainingSource for MemorySource {
    fn load_cohort(&self, cohort: &str) -> Result<Vec<EnrolledIdentity>, SourceError> {
        Ok(self.cohorts.get(cohort).cloned().unwrap_or_default())
    }
}
