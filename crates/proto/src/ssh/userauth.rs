//! Client side of user authentication (RFC 4252, RFC 4256).
//!
//! [`UserAuth`] runs after key exchange. It requests the `ssh-userauth`
//! service, optionally probes with `none`, then walks `publickey`, `password`
//! and `keyboard-interactive` in that order, skipping methods the server does
//! not list. Each method runs until it succeeds or has nothing left to offer;
//! once every method is used up the result is a DISCONNECT(14) error.
//!
//! Errors raised by [`ClientHandler`] hooks are returned unchanged as
//! [`KeygateError::Callback`].

use crate::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    InfoRequest, InfoResponse, PasswordChangeRequest, METHOD_KEYBOARD_INTERACTIVE, METHOD_NONE,
    METHOD_PASSWORD, METHOD_PUBLICKEY, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::credentials::{ClientKey, KeyCursor};
use crate::ssh::handler::ClientHandler;
use crate::ssh::message::{
    parse_service_message, service_message, DisconnectReason, MessageType,
};
use crate::ssh::transport::Transport;
use keygate_platform::{KeygateError, KeygateResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

const METHOD_ORDER: [&str; 3] = [METHOD_PUBLICKEY, METHOD_PASSWORD, METHOD_KEYBOARD_INTERACTIVE];

/// Reason attached to the exhaustion disconnect.
pub const NO_MORE_METHODS: &str = "No more authentication methods available";

/// Credentials for one authentication run.
#[derive(Debug)]
pub struct AuthContext<'a> {
    /// User to authenticate as
    pub username: &'a str,
    /// Session identifier from key exchange
    pub session_id: &'a [u8],
    /// Configured password
    pub password: Option<&'a str>,
    /// Plain password rejections tolerated
    pub password_attempts: u32,
    /// Whether to probe with the "none" method first
    pub allow_none_auth: bool,
    /// Keys to offer, in order
    pub keys: KeyCursor,
    /// False when the caller passed an explicit empty key list. The
    /// publickey method is then skipped and its hook never consulted.
    pub publickey_enabled: bool,
}

enum Reply {
    Success,
    Failure(AuthFailure),
    /// Message 60, interpreted by the method in flight
    Info(Vec<u8>),
}

enum MethodResult {
    Success,
    /// Nothing left to try; carries the most recent failure, if any was received.
    Exhausted(Option<AuthFailure>),
}

/// Drives authentication over an established transport.
pub struct UserAuth<'a, R, W, H: ?Sized> {
    transport: &'a mut Transport<R, W>,
    handler: &'a mut H,
    ctx: AuthContext<'a>,
}

impl<'a, R, W, H> UserAuth<'a, R, W, H>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: ClientHandler + ?Sized,
{
    /// Creates a coordinator.
    pub fn new(transport: &'a mut Transport<R, W>, handler: &'a mut H, ctx: AuthContext<'a>) -> Self {
        Self {
            transport,
            handler,
            ctx,
        }
    }

    /// Authenticates, returning the name of the method that succeeded.
    pub async fn run(mut self) -> KeygateResult<&'static str> {
        self.transport
            .send(&service_message(MessageType::ServiceRequest, SERVICE_USERAUTH))
            .await?;
        let reply = self.transport.recv().await?;
        let service = parse_service_message(MessageType::ServiceAccept, &reply)?;
        if service != SERVICE_USERAUTH {
            return Err(KeygateError::Protocol(format!(
                "Server accepted unexpected service: {}",
                service
            )));
        }

        let mut methods: Vec<String> = METHOD_ORDER.iter().map(|m| m.to_string()).collect();
        if self.ctx.allow_none_auth {
            match self.request(AuthMethod::None).await? {
                Reply::Success => {
                    info!(user = self.ctx.username, "Authenticated without credentials");
                    return Ok(METHOD_NONE);
                }
                Reply::Failure(failure) => methods = failure.methods_can_continue().to_vec(),
                Reply::Info(_) => return Err(unexpected_info()),
            }
        }
        debug!("Server offers methods: {}", methods.join(","));

        let mut used: Vec<&'static str> = Vec::new();
        if !self.ctx.publickey_enabled {
            used.push(METHOD_PUBLICKEY);
        }
        loop {
            let method = METHOD_ORDER
                .into_iter()
                .find(|m| !used.contains(m) && methods.iter().any(|s| s == m));
            let Some(method) = method else {
                info!(user = self.ctx.username, "{}", NO_MORE_METHODS);
                return Err(KeygateError::Disconnect {
                    code: DisconnectReason::NoMoreAuthMethodsAvailable.code(),
                    reason: NO_MORE_METHODS.to_string(),
                });
            };

            debug!(method, "Trying authentication method");
            let result = match method {
                METHOD_PUBLICKEY => self.publickey().await?,
                METHOD_PASSWORD => self.password().await?,
                _ => self.keyboard_interactive().await?,
            };

            match result {
                MethodResult::Success => {
                    info!(user = self.ctx.username, method, "Authentication succeeded");
                    return Ok(method);
                }
                MethodResult::Exhausted(failure) => {
                    used.push(method);
                    if let Some(failure) = failure {
                        if failure.partial_success() {
                            debug!(method, "Partial success, more methods required");
                        }
                        methods = failure.methods_can_continue().to_vec();
                    }
                }
            }
        }
    }

    async fn recv(&mut self) -> KeygateResult<Reply> {
        loop {
            let payload = self.transport.recv().await?;
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::UserauthSuccess) => return Ok(Reply::Success),
                Some(MessageType::UserauthFailure) => {
                    return Ok(Reply::Failure(AuthFailure::from_bytes(&payload)?))
                }
                Some(MessageType::UserauthPkOk) => return Ok(Reply::Info(payload)),
                Some(MessageType::UserauthBanner) => {
                    let banner = AuthBanner::from_bytes(&payload)?;
                    self.handler
                        .auth_banner_received(banner.message(), banner.language_tag())
                        .await
                        .map_err(KeygateError::Callback)?;
                }
                _ => {
                    return Err(KeygateError::Protocol(format!(
                        "Unexpected message {} during authentication",
                        payload[0]
                    )))
                }
            }
        }
    }

    async fn request(&mut self, method: AuthMethod) -> KeygateResult<Reply> {
        let request = AuthRequest::new(self.ctx.username, SERVICE_CONNECTION, method);
        self.transport.send(&request.to_bytes()).await?;
        self.recv().await
    }

    async fn next_key(&mut self) -> KeygateResult<Option<ClientKey>> {
        if let Some(key) = self.ctx.keys.next_key() {
            return Ok(Some(key));
        }
        match self
            .handler
            .public_key_auth_requested()
            .await
            .map_err(KeygateError::Callback)?
        {
            Some(spec) => spec.load().map(Some),
            None => Ok(None),
        }
    }

    async fn publickey(&mut self) -> KeygateResult<MethodResult> {
        let mut last = None;
        while let Some(key) = self.next_key().await? {
            let algorithm = key.algorithm();
            let blob = key.public_blob();
            debug!(algorithm, "Offering public key {}", key.public_key().fingerprint());

            let query = AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob.clone(),
                signature: None,
            };
            let failure = match self.request(query).await? {
                Reply::Success => return Ok(MethodResult::Success),
                Reply::Failure(failure) => failure,
                Reply::Info(payload) => {
                    let ok = AuthPkOk::from_bytes(&payload)?;
                    if ok.public_key() != blob.as_slice() {
                        return Err(KeygateError::Protocol(
                            "PK_OK for a key that was not offered".to_string(),
                        ));
                    }

                    let data = construct_signature_data(
                        self.ctx.session_id,
                        self.ctx.username,
                        SERVICE_CONNECTION,
                        algorithm,
                        &blob,
                    );
                    let signature = key.sign(&data).await?;
                    let signed = AuthMethod::PublicKey {
                        algorithm: algorithm.to_string(),
                        public_key: blob,
                        signature: Some(signature),
                    };
                    match self.request(signed).await? {
                        Reply::Success => return Ok(MethodResult::Success),
                        Reply::Failure(failure) => failure,
                        Reply::Info(_) => return Err(unexpected_info()),
                    }
                }
            };

            debug!("Public key rejected");
            let more = failure.methods_can_continue().iter().any(|m| m == METHOD_PUBLICKEY);
            last = Some(failure);
            if !more {
                break;
            }
        }
        Ok(MethodResult::Exhausted(last))
    }

    async fn password(&mut self) -> KeygateResult<MethodResult> {
        let mut last = None;
        for attempt in 1..=self.ctx.password_attempts {
            let configured = match attempt {
                1 => self.ctx.password.map(str::to_string),
                _ => None,
            };
            let password = match configured {
                Some(password) => password,
                None => match self
                    .handler
                    .password_auth_requested()
                    .await
                    .map_err(KeygateError::Callback)?
                {
                    Some(password) => password,
                    None => break,
                },
            };

            match self.request(AuthMethod::password(password)).await? {
                Reply::Success => return Ok(MethodResult::Success),
                Reply::Failure(failure) => {
                    debug!(attempt, "Password rejected");
                    let more = failure.methods_can_continue().iter().any(|m| m == METHOD_PASSWORD);
                    last = Some(failure);
                    if !more {
                        break;
                    }
                }
                Reply::Info(payload) => return self.change_password(&payload, last).await,
            }
        }
        Ok(MethodResult::Exhausted(last))
    }

    async fn change_password(
        &mut self,
        payload: &[u8],
        last: Option<AuthFailure>,
    ) -> KeygateResult<MethodResult> {
        let change = PasswordChangeRequest::from_bytes(payload)?;
        debug!("Server requested a password change");

        let answer = self
            .handler
            .password_change_requested(change.prompt(), change.language())
            .await
            .map_err(KeygateError::Callback)?;
        let Some((old, new)) = answer else {
            debug!("No password change offered");
            return Ok(MethodResult::Exhausted(last));
        };

        let method = AuthMethod::Password {
            password: old,
            new_password: Some(new),
        };
        match self.request(method).await? {
            Reply::Success => Ok(MethodResult::Success),
            Reply::Failure(failure) => {
                debug!("Password change rejected");
                Ok(MethodResult::Exhausted(Some(failure)))
            }
            Reply::Info(_) => {
                debug!("Password change requested again");
                Ok(MethodResult::Exhausted(last))
            }
        }
    }

    async fn keyboard_interactive(&mut self) -> KeygateResult<MethodResult> {
        let start = AuthMethod::KeyboardInteractive {
            language: String::new(),
            submethods: String::new(),
        };
        let mut reply = self.request(start).await?;
        let mut password = self.ctx.password;

        loop {
            let payload = match reply {
                Reply::Success => return Ok(MethodResult::Success),
                Reply::Failure(failure) => return Ok(MethodResult::Exhausted(Some(failure))),
                Reply::Info(payload) => payload,
            };

            let challenge = InfoRequest::from_bytes(&payload)?;
            let responses = if challenge.prompts().is_empty() {
                Vec::new()
            } else {
                let answer = self
                    .handler
                    .keyboard_interactive_requested(
                        challenge.name(),
                        challenge.instruction(),
                        challenge.prompts(),
                    )
                    .await
                    .map_err(KeygateError::Callback)?;
                // The configured password answers at most one challenge.
                let responses = match answer {
                    Some(responses) => Some(responses),
                    None if challenge.prompts().len() == 1 => {
                        password.take().map(|p| vec![p.to_string()])
                    }
                    None => None,
                };
                match responses {
                    Some(responses) => responses,
                    None => {
                        debug!("No keyboard-interactive responses offered");
                        return Ok(MethodResult::Exhausted(None));
                    }
                }
            };

            self.transport
                .send(&InfoResponse::new(responses).to_bytes())
                .await?;
            reply = self.recv().await?;
        }
    }
}

fn unexpected_info() -> KeygateError {
    KeygateError::Protocol("Unexpected SSH_MSG_USERAUTH_INFO_REQUEST".to_string())
}
