//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! This module encodes and decodes the user authentication messages for the
//! methods this crate speaks:
//! - "none" - Probe for the server's method list (or an open account)
//! - "publickey" - Public key authentication (Ed25519 keys and certificates)
//! - "password" - Password authentication, including password change
//! - "keyboard-interactive" - Challenge/response prompts (RFC 4256)
//!
//! Message number 60 is shared by `USERAUTH_PK_OK`, `USERAUTH_PASSWD_CHANGEREQ`
//! and `USERAUTH_INFO_REQUEST`; the method in flight decides which parser applies.
//!
//! # Security
//!
//! - **Constant-time password comparison** - Prevents timing attacks
//! - **Zeroized secrets** - Passwords and prompt responses are wiped on drop
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::auth::{AuthMethod, AuthRequest, SERVICE_CONNECTION};
//!
//! let auth = AuthRequest::new("user", SERVICE_CONNECTION, AuthMethod::password("secret"));
//! let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
//! assert_eq!(parsed.method().name(), "password");
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";
/// Service started once authentication succeeds.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// "none" method name.
pub const METHOD_NONE: &str = "none";
/// "publickey" method name.
pub const METHOD_PUBLICKEY: &str = "publickey";
/// "password" method name.
pub const METHOD_PASSWORD: &str = "password";
/// "keyboard-interactive" method name.
pub const METHOD_KEYBOARD_INTERACTIVE: &str = "keyboard-interactive";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication.
    None,
    /// Password authentication.
    Password {
        /// Current password
        password: String,
        /// Replacement password, when answering a change request
        new_password: Option<String>,
    },
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key or certificate blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty)
        language: String,
        /// Comma-separated submethod hints
        submethods: String,
    },
}

impl AuthMethod {
    /// Plain password request.
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password {
            password: password.into(),
            new_password: None,
        }
    }

    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => METHOD_NONE,
            AuthMethod::Password { .. } => METHOD_PASSWORD,
            AuthMethod::PublicKey { .. } => METHOD_PUBLICKEY,
            AuthMethod::KeyboardInteractive { .. } => METHOD_KEYBOARD_INTERACTIVE,
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(new_password) = new_password {
                new_password.zeroize();
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_str(&self.user_name);
        buf.put_str(&self.service_name);
        buf.put_str(self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                buf.put_bool(new_password.is_some());
                buf.put_str(password);
                if let Some(new_password) = new_password {
                    buf.put_str(new_password);
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_str(algorithm);
                buf.put_string(public_key);
                if let Some(sig) = signature {
                    buf.put_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                buf.put_str(language);
                buf.put_str(submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// Unknown method names are a protocol error; servers should check the
    /// method name with [`AuthRequest::peek_method`] first if they need to
    /// answer unsupported methods with a failure.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::UserauthRequest as u8, "SSH_MSG_USERAUTH_REQUEST")?;
        let user_name = r.read_utf8()?;
        let service_name = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            METHOD_NONE => AuthMethod::None,
            METHOD_PASSWORD => {
                let changing = r.read_bool()?;
                let password = r.read_utf8()?;
                let new_password = if changing { Some(r.read_utf8()?) } else { None };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            METHOD_PUBLICKEY => {
                let has_signature = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            METHOD_KEYBOARD_INTERACTIVE => AuthMethod::KeyboardInteractive {
                language: r.read_utf8()?,
                submethods: r.read_utf8()?,
            },
            _ => {
                return Err(KeygateError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }

    /// Reads only the user, service and method names of a request.
    pub fn peek_method(data: &[u8]) -> KeygateResult<(String, String, String)> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::UserauthRequest as u8, "SSH_MSG_USERAUTH_REQUEST")?;
        Ok((r.read_utf8()?, r.read_utf8()?, r.read_utf8()?))
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods_can_continue);
        buf.put_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::UserauthFailure as u8, "SSH_MSG_USERAUTH_FAILURE")?;
        Ok(Self {
            methods_can_continue: r.read_name_list()?,
            partial_success: r.read_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message (RFC 4252 Section 5.1).
pub fn auth_success() -> Vec<u8> {
    vec![MessageType::UserauthSuccess as u8]
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language_tag: String::new(),
        }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the language tag.
    pub fn language_tag(&self) -> &str {
        &self.language_tag
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_str(&self.message);
        buf.put_str(&self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::UserauthBanner as u8, "SSH_MSG_USERAUTH_BANNER")?;
        Ok(Self {
            message: r.read_utf8()?,
            language_tag: r.read_utf8()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// Sent by the server to indicate that the public key is acceptable
/// for authentication (in response to a query without signature).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new SSH_MSG_USERAUTH_PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.algorithm);
        buf.put_string(&self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::UserauthPkOk as u8, "SSH_MSG_USERAUTH_PK_OK")?;
        Ok(Self {
            algorithm: r.read_utf8()?,
            public_key: r.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (RFC 4252 Section 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChangeRequest {
    prompt: String,
    language: String,
}

impl PasswordChangeRequest {
    /// Creates a change request with the given prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            language: String::new(),
        }
    }

    /// Returns the prompt.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Returns the language tag.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.prompt);
        buf.put_str(&self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(
            MessageType::UserauthPkOk as u8,
            "SSH_MSG_USERAUTH_PASSWD_CHANGEREQ",
        )?;
        Ok(Self {
            prompt: r.read_utf8()?,
            language: r.read_utf8()?,
        })
    }
}

/// A single keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Text shown to the user
    pub prompt: String,
    /// Whether the response may be echoed
    pub echo: bool,
}

impl Prompt {
    /// Creates a prompt.
    pub fn new(prompt: impl Into<String>, echo: bool) -> Self {
        Self {
            prompt: prompt.into(),
            echo,
        }
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    name: String,
    instruction: String,
    language: String,
    prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Creates an info request.
    pub fn new(name: impl Into<String>, instruction: impl Into<String>, prompts: Vec<Prompt>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            language: String::new(),
            prompts,
        }
    }

    /// Returns the challenge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instruction text.
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Returns the prompts.
    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.name);
        buf.put_str(&self.instruction);
        buf.put_str(&self.language);
        buf.put_u32(self.prompts.len() as u32);
        for p in &self.prompts {
            buf.put_str(&p.prompt);
            buf.put_bool(p.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(
            MessageType::UserauthPkOk as u8,
            "SSH_MSG_USERAUTH_INFO_REQUEST",
        )?;
        let name = r.read_utf8()?;
        let instruction = r.read_utf8()?;
        let language = r.read_utf8()?;
        let count = r.read_u32()?;

        let mut prompts = Vec::new();
        for _ in 0..count {
            let prompt = r.read_utf8()?;
            let echo = r.read_bool()?;
            prompts.push(Prompt { prompt, echo });
        }

        Ok(Self {
            name,
            instruction,
            language,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    responses: Vec<String>,
}

impl InfoResponse {
    /// Creates a response.
    pub fn new(responses: Vec<String>) -> Self {
        Self { responses }
    }

    /// Returns the responses.
    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            buf.put_str(response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(
            MessageType::UserauthInfoResponse as u8,
            "SSH_MSG_USERAUTH_INFO_RESPONSE",
        )?;
        let count = r.read_u32()?;
        let mut responses = Vec::new();
        for _ in 0..count {
            responses.push(r.read_utf8()?);
        }
        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        self.responses.iter_mut().for_each(Zeroize::zeroize);
    }
}

/// Constructs the data to be signed for public key authentication (RFC 4252 Section 7).
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE (has signature)
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_str(user_name);
    buf.put_str(service_name);
    buf.put_str(METHOD_PUBLICKEY);
    buf.put_bool(true);
    buf.put_str(algorithm);
    buf.put_string(public_key_blob);
    buf.to_vec()
}

/// Compares two passwords in constant time to prevent timing attacks.
///
/// ```rust
/// use keygate_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    // Hash first so differing lengths take the same time.
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.as_slice().ct_eq(hash_b.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_request_password() {
        let auth = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::password("secret"));
        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed, auth);
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.service_name(), "ssh-connection");
    }

    #[test]
    fn test_auth_request_password_change() {
        let auth = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::Password {
                password: "oldpw".to_string(),
                new_password: Some("pw".to_string()),
            },
        );
        let bytes = auth.to_bytes();
        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        match parsed.method() {
            AuthMethod::Password {
                password,
                new_password,
            } => {
                assert_eq!(password, "oldpw");
                assert_eq!(new_password.as_deref(), Some("pw"));
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_auth_request_publickey() {
        let auth = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let bytes = auth.to_bytes();
        assert_eq!(bytes[0], 50);
        assert_eq!(AuthRequest::from_bytes(&bytes).unwrap(), auth);
        assert_eq!(
            AuthRequest::peek_method(&bytes).unwrap(),
            (
                "bob".to_string(),
                "ssh-connection".to_string(),
                "publickey".to_string()
            )
        );
    }

    #[test]
    fn test_auth_request_keyboard_interactive() {
        let auth = AuthRequest::new(
            "kbdint",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: String::new(),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&auth.to_bytes()).unwrap(), auth);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        buf.put_str("u");
        buf.put_str("ssh-connection");
        buf.put_str("hostbased");
        assert!(AuthRequest::from_bytes(&buf).is_err());
        assert_eq!(AuthRequest::peek_method(&buf).unwrap().2, "hostbased");
    }

    #[test]
    fn test_auth_failure() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], false);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.methods_can_continue(), &["publickey", "password"]);
        assert!(!parsed.partial_success());

        let empty = AuthFailure::from_bytes(&AuthFailure::new(vec![], false).to_bytes()).unwrap();
        assert!(empty.methods_can_continue().is_empty());
    }

    #[test]
    fn test_auth_banner() {
        let banner = AuthBanner::new("Welcome!\n");
        assert_eq!(AuthBanner::from_bytes(&banner.to_bytes()).unwrap(), banner);
    }

    #[test]
    fn test_message_60_variants() {
        let pk_ok = AuthPkOk::new("ssh-ed25519", vec![1, 2, 3, 4]);
        assert_eq!(AuthPkOk::from_bytes(&pk_ok.to_bytes()).unwrap(), pk_ok);

        let change = PasswordChangeRequest::new("Password expired");
        let bytes = change.to_bytes();
        assert_eq!(bytes[0], 60);
        assert_eq!(PasswordChangeRequest::from_bytes(&bytes).unwrap(), change);

        let info = InfoRequest::new(
            "Challenge",
            "Answer the question",
            vec![Prompt::new("Password: ", false), Prompt::new("Code: ", true)],
        );
        let parsed = InfoRequest::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.prompts()[1].prompt, "Code: ");
        assert!(parsed.prompts()[1].echo);
    }

    #[test]
    fn test_info_response() {
        let response = InfoResponse::new(vec!["kbdint".to_string(), String::new()]);
        let parsed = InfoResponse::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(parsed.responses(), &["kbdint", ""]);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("password", "password"));
        assert!(!constant_time_compare("password", "wrong"));
        assert!(!constant_time_compare("", "x"));
    }

    #[test]
    fn test_construct_signature_data() {
        let data = construct_signature_data(b"sid", "user", SERVICE_CONNECTION, "ssh-ed25519", b"key");
        let mut r = WireReader::new(&data);
        assert_eq!(r.read_string().unwrap(), b"sid");
        assert_eq!(r.read_u8().unwrap(), 50);
        assert_eq!(r.read_utf8().unwrap(), "user");
        assert_eq!(r.read_utf8().unwrap(), "ssh-connection");
        assert_eq!(r.read_utf8().unwrap(), "publickey");
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_utf8().unwrap(), "ssh-ed25519");
        assert_eq!(r.read_string().unwrap(), b"key");
        assert!(r.is_empty());
    }
}
