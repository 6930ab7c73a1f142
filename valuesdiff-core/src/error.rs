use thiserror::Error;

use crate::expr::GateError;

/// Failure of a reconciliation cycle driven through a [`crate::Reconciler`].
///
/// In every case the stored state is left as it was before the cycle.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("could not load the state of resource `{name}`")]
    Load {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not store the state of resource `{name}`")]
    Store {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Gate(e) => e.tag(),
            Error::Load { .. } => "LoadError",
            Error::Store { .. } => "StoreError",
        }
    }
}
