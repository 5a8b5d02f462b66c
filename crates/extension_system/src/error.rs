use thiserror::Error;

use crate::manifest::Capability;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("Invalid extension manifest: {0}")]
    InvalidManifest(String),
    #[error("No factory registered for entry point '{0}'")]
    UnknownEntryPoint(String),
    #[error("Extension '{0}' is already loaded")]
    AlreadyLoaded(String),
    #[error("Extension '{0}' is not loaded")]
    NotLoaded(String),
    #[error("Extension '{extension}' lacks the '{capability}' capability")]
    CapabilityDenied {
        extension: String,
        capability: Capability,
    },
    #[error("Extension '{extension}' failed in {hook}: {source}")]
    Hook {
        extension: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Registry(#[from] crate::tools::RegistryError),
}

pub type Result<T> = std::result::Result<T, ExtensionError>;
