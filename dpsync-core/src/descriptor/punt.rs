//! Punting of dataplane traffic to the host

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{Descriptor, KvWithMetadata};
use crate::handle::{HandleError, PuntHandle};
use crate::model::punt::PUNT_TO_HOST_KEY_PREFIX;
use crate::model::{L3Protocol, L4Protocol, PuntToHost};
use crate::resync::pool::Discovery;

pub const PUNT_DESCRIPTOR_NAME: &str = "vpp-punt-to-host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PuntValidationError {
    #[error("L3 protocol not defined")]
    WithoutL3Protocol,
    #[error("L4 protocol not defined")]
    WithoutL4Protocol,
    #[error("port not defined")]
    WithoutPort,
}

/// Errors that no retry can fix without a configuration change.
pub const NON_RETRIABLE_PUNT_ERRORS: [PuntValidationError; 3] = [
    PuntValidationError::WithoutL3Protocol,
    PuntValidationError::WithoutL4Protocol,
    PuntValidationError::WithoutPort,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuntAction {
    Add,
    RegisterSocket,
    DeregisterSocket,
}

impl fmt::Display for PuntAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add punt"),
            Self::RegisterSocket => write!(f, "register punt socket"),
            Self::DeregisterSocket => write!(f, "deregister punt socket"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PuntError {
    #[error("invalid punt to host: {0}")]
    Invalid(#[from] PuntValidationError),
    #[error("failed to {action}: {source}")]
    Handle {
        action: PuntAction,
        #[source]
        source: HandleError,
    },
}

fn validate(punt: &PuntToHost) -> Result<(), PuntValidationError> {
    if punt.l3_protocol == L3Protocol::Undefined {
        return Err(PuntValidationError::WithoutL3Protocol);
    }
    if punt.l4_protocol == L4Protocol::Undefined {
        return Err(PuntValidationError::WithoutL4Protocol);
    }
    if punt.port == 0 {
        return Err(PuntValidationError::WithoutPort);
    }
    Ok(())
}

/// Punt rules, either to the host stack or to a registered unix socket.
///
/// The dataplane cannot list punt rules, so the engine keeps its own view of
/// this type.
pub struct PuntDescriptor {
    handle: Arc<dyn PuntHandle>,
}

impl PuntDescriptor {
    pub fn new(handle: Arc<dyn PuntHandle>) -> Self {
        Self { handle }
    }

    fn call(
        &self,
        punt: &PuntToHost,
        action: PuntAction,
        call: impl FnOnce(&dyn PuntHandle, &PuntToHost) -> Result<(), HandleError>,
    ) -> Result<(), PuntError> {
        call(self.handle.as_ref(), punt).map_err(|source| {
            error!(punt = ?punt, error = %source, "Failed to {action}");
            PuntError::Handle { action, source }
        })?;
        debug!(punt = ?punt, "{action} done");
        Ok(())
    }
}

impl Descriptor for PuntDescriptor {
    type Value = PuntToHost;
    type Metadata = ();
    type Error = PuntError;

    fn name(&self) -> &str {
        PUNT_DESCRIPTOR_NAME
    }

    fn is_key(&self, key: &str) -> bool {
        key.starts_with(PUNT_TO_HOST_KEY_PREFIX)
    }

    fn equivalent(&self, _key: &str, old: &PuntToHost, new: &PuntToHost) -> bool {
        old == new
    }

    fn add(&self, _key: &str, punt: &PuntToHost) -> Result<(), PuntError> {
        validate(punt).map_err(|err| {
            error!(punt = ?punt, error = %err, "Invalid punt to host");
            err
        })?;
        if punt.socket_path.is_empty() {
            self.call(punt, PuntAction::Add, |handle, punt| handle.add_punt(punt))
        } else {
            self.call(punt, PuntAction::RegisterSocket, |handle, punt| {
                handle.register_punt_socket(punt)
            })
        }
    }

    fn delete(&self, _key: &str, punt: &PuntToHost, _metadata: Option<&()>) -> Result<(), PuntError> {
        if punt.socket_path.is_empty() {
            warn!(punt = ?punt, "Removing punt to host is not supported by the dataplane");
            return Ok(());
        }
        self.call(punt, PuntAction::DeregisterSocket, |handle, punt| {
            handle.deregister_punt_socket(punt)
        })
    }

    fn modify_with_recreate(
        &self,
        _key: &str,
        _old: &PuntToHost,
        _new: &PuntToHost,
        _metadata: Option<&()>,
    ) -> bool {
        true
    }

    fn is_retriable_failure(&self, err: &PuntError) -> bool {
        match err {
            PuntError::Invalid(invalid) => !NON_RETRIABLE_PUNT_ERRORS.contains(invalid),
            _ => true,
        }
    }

    fn dump_supported(&self) -> bool {
        false
    }

    fn dump(
        &self,
        _correlate: &[KvWithMetadata<PuntToHost, ()>],
    ) -> Discovery<KvWithMetadata<PuntToHost, ()>, PuntError> {
        warn!("Dump of punt to host is not supported by the dataplane");
        Discovery::empty()
    }
}
