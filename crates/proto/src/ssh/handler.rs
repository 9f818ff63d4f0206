//! Client-side callbacks.
//!
//! A [`ClientHandler`] is consulted while a connection is being set up. Every
//! method has a default, so an implementation only overrides the hooks it
//! cares about. Returning `Ok(None)` from a credential hook means "nothing to
//! offer" and moves authentication on; returning `Err` aborts the connection
//! and the error reaches the caller unchanged as [`KeygateError::Callback`].
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::handler::{CallbackResult, ClientHandler};
//!
//! struct Prompter;
//!
//! #[async_trait::async_trait]
//! impl ClientHandler for Prompter {
//!     async fn password_auth_requested(&mut self) -> CallbackResult<Option<String>> {
//!         Ok(Some("hunter2".to_string()))
//!     }
//! }
//! ```
//!
//! [`KeygateError::Callback`]: keygate_platform::KeygateError::Callback

use crate::ssh::auth::Prompt;
use crate::ssh::credentials::ClientKeySpec;
use keygate_platform::BoxError;
use tracing::info;

/// Result type of handler hooks.
pub type CallbackResult<T> = Result<T, BoxError>;

/// Hooks invoked while connecting and authenticating.
#[async_trait::async_trait]
pub trait ClientHandler: Send {
    /// Called once the TCP connection is up, before any SSH traffic.
    async fn connection_established(&mut self) -> CallbackResult<()> {
        Ok(())
    }

    /// Called for every USERAUTH_BANNER the server sends.
    async fn auth_banner_received(&mut self, message: &str, language: &str) -> CallbackResult<()> {
        let _ = language;
        info!("Server banner: {}", message.trim_end());
        Ok(())
    }

    /// Supplies another key once the configured keys are used up.
    async fn public_key_auth_requested(&mut self) -> CallbackResult<Option<ClientKeySpec>> {
        Ok(None)
    }

    /// Supplies a password when none is configured.
    async fn password_auth_requested(&mut self) -> CallbackResult<Option<String>> {
        Ok(None)
    }

    /// Answers a password change request with `(old, new)`.
    async fn password_change_requested(
        &mut self,
        prompt: &str,
        language: &str,
    ) -> CallbackResult<Option<(String, String)>> {
        let _ = (prompt, language);
        Ok(None)
    }

    /// Answers a keyboard-interactive challenge, one response per prompt.
    async fn keyboard_interactive_requested(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> CallbackResult<Option<Vec<String>>> {
        let _ = (name, instruction, prompts);
        Ok(None)
    }
}

/// Handler that relies on configuration alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClientHandler;

impl ClientHandler for DefaultClientHandler {}
