//! Crate-wide error type and the failure taxonomy the orchestrator reports.

use std::fmt;

use crate::bridge::{BridgeError, CryptoError, PayloadError, RelayError};
use crate::config::ConfigError;
use crate::field::EncodingError;
use crate::identity::IdentityError;
use crate::inclusion::InclusionError;
use crate::merkle::TreeError;
use crate::orchestrator::FlowError;
use crate::prover::ProofGenerationError;
use crate::session::SessionError;
use crate::verifier::VerifierError;

/// How a failure should be presented and whether it can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad scanned code or payload. Rescan or repaste.
    Input,
    /// Authentication tag or proof verification failure. Terminal.
    Crypto,
    /// Fetch failure or non-2xx. User-initiated retry only.
    Network,
    /// A business rule refused the request.
    Policy,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::Input => "invalid input",
            ErrorCategory::Crypto => "cryptographic failure",
            ErrorCategory::Network => "network failure",
            ErrorCategory::Policy => "refused",
            ErrorCategory::Config => "configuration error",
        })
    }
}

/// Errors that know their [`ErrorCategory`].
pub trait Categorized {
    fn category(&self) -> ErrorCategory;
}

impl Categorized for ConfigError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

impl Categorized for IdentityError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

impl Categorized for EncodingError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Input
    }
}

impl Categorized for TreeError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Input
    }
}

impl Categorized for PayloadError {
    fn category(&self) -> ErrorCategory {
        match self {
            PayloadError::NoCredentialTypes => ErrorCategory::Policy,
            PayloadError::InvalidJson(_) | PayloadError::MissingField(_) => ErrorCategory::Input,
        }
    }
}

impl Categorized for CryptoError {
    fn category(&self) -> ErrorCategory {
        match self {
            CryptoError::InvalidKey(_) | CryptoError::InvalidIv(_) | CryptoError::Base64(_) => ErrorCategory::Input,
            CryptoError::Encryption | CryptoError::Authentication => ErrorCategory::Crypto,
        }
    }
}

impl Categorized for RelayError {
    fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidUrl(_) => ErrorCategory::Input,
            _ => ErrorCategory::Network,
        }
    }
}

impl Categorized for BridgeError {
    fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::Relay(e) => e.category(),
            BridgeError::Crypto(e) => e.category(),
            BridgeError::Payload(e) => e.category(),
            BridgeError::IllegalTransition { .. } | BridgeError::NotDismissable(_) | BridgeError::Serialization(_) => {
                ErrorCategory::Input
            }
        }
    }
}

impl Categorized for ProofGenerationError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProofGenerationError::IoError(_) | ProofGenerationError::CorruptProvingKey(_) => ErrorCategory::Config,
            _ => ErrorCategory::Crypto,
        }
    }
}

impl Categorized for VerifierError {
    fn category(&self) -> ErrorCategory {
        match self {
            VerifierError::IoError(_) => ErrorCategory::Config,
            _ => ErrorCategory::Crypto,
        }
    }
}

impl Categorized for InclusionError {
    fn category(&self) -> ErrorCategory {
        if self.is_config() {
            ErrorCategory::Config
        } else {
            ErrorCategory::Network
        }
    }
}

impl Categorized for SessionError {
    fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Transport(_) => ErrorCategory::Network,
            SessionError::NotConnected => ErrorCategory::Config,
            SessionError::InvalidRequest(e) => e.category(),
            _ => ErrorCategory::Input,
        }
    }
}

/// Any error the library can produce.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Proof(#[from] ProofGenerationError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    Inclusion(#[from] InclusionError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl Categorized for SimulatorError {
    fn category(&self) -> ErrorCategory {
        match self {
            SimulatorError::Config(e) => e.category(),
            SimulatorError::Identity(e) => e.category(),
            SimulatorError::Encoding(e) => e.category(),
            SimulatorError::Tree(e) => e.category(),
            SimulatorError::Proof(e) => e.category(),
            SimulatorError::Verifier(e) => e.category(),
            SimulatorError::Inclusion(e) => e.category(),
            SimulatorError::Bridge(e) => e.category(),
            SimulatorError::Session(e) => e.category(),
            SimulatorError::Flow(e) => e.category(),
        }
    }
}

pub type Result<T, E = SimulatorError> = std::result::Result<T, E>;
