use thiserror::Error;

/// Why a rehost job failed, classified by whether retrying could help.
#[derive(Debug, Error)]
pub(crate) enum Failure {
    #[error("extraction failed: {0}")]
    ExtractionTransient(String),

    #[error("extraction failed permanently: {0}")]
    ExtractionPermanent(String),

    #[error("archival failed: {0}")]
    ArchivalTransient(String),

    #[error("persistence failed: {0}")]
    PersistenceTransient(String),
}

impl Failure {
    pub(crate) fn is_transient(&self) -> bool {
        !matches!(self, Self::ExtractionPermanent(_))
    }
}
