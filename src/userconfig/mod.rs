//! Per-user configuration: encrypted secret storage, the REST resolver the
//! workers call, and the serving side of the same contract.

pub mod encryption;
pub mod resolver;
pub mod server;

pub use encryption::EncryptedBlob;
pub use resolver::{ResolvedUserConfig, UserConfigResolver};
