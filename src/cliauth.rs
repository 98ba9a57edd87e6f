//! Client side user authentication, [RFC4252](https://tools.ietf.org/html/rfc4252).
//!
//! Each attempt is a single request. Publickey requests are sent
//! already signed rather than querying the key first.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::config::AuthMethod;
use crate::kex::SessId;
use crate::packets::{self, MethodPubKey, ParseContext, Signature, Userauth60};
use crate::sign::SignKey;
use crate::sshnames::*;
use crate::sshwire::{BinString, Blob};
use crate::traffic::TrafSend;

#[derive(Debug)]
enum AuthState {
    /// No request sent yet
    Idle,
    /// Waiting for the server's reply
    Request { method: AuthMethod },
    /// A failure waiting for the application
    Failed { methods: String },
    PasswordExpired,
    Success { method: AuthMethod },
}

/// Result of polling an authentication attempt
#[derive(Debug, PartialEq)]
pub(crate) enum AuthStatus {
    /// No attempt in progress
    Idle,
    Pending,
    Success,
    Failed { methods: String },
    PasswordExpired,
}

pub(crate) struct CliAuth {
    state: AuthState,
    /// `ssh-userauth` service has been requested
    service_sent: bool,
}

impl CliAuth {
    pub fn new() -> Self {
        CliAuth { state: AuthState::Idle, service_sent: false }
    }

    pub fn is_authed(&self) -> bool {
        matches!(self.state, AuthState::Success { .. })
    }

    /// The method that succeeded
    pub fn method(&self) -> Option<AuthMethod> {
        match self.state {
            AuthState::Success { method } => Some(method),
            _ => None,
        }
    }

    /// Returns the state of the current attempt.
    ///
    /// A failure is reported once, after which a new attempt can start.
    pub fn poll(&mut self) -> AuthStatus {
        match &self.state {
            AuthState::Idle => AuthStatus::Idle,
            AuthState::Request { .. } => AuthStatus::Pending,
            AuthState::Success { .. } => AuthStatus::Success,
            AuthState::Failed { .. } | AuthState::PasswordExpired => {
                let st = core::mem::replace(&mut self.state, AuthState::Idle);
                match st {
                    AuthState::Failed { methods } => AuthStatus::Failed { methods },
                    _ => AuthStatus::PasswordExpired,
                }
            }
        }
    }

    fn check_start(&mut self, s: &mut TrafSend) -> Result<()> {
        match self.state {
            AuthState::Idle => (),
            AuthState::Success { .. } => {
                return Err(Error::InvalidState { what: "already authenticated" })
            }
            _ => return Err(Error::InvalidState { what: "authentication in progress" }),
        }

        if !self.service_sent {
            s.send(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH })?;
            self.service_sent = true;
        }
        Ok(())
    }

    pub fn request_password(
        &mut self,
        username: &str,
        password: &str,
        parse_ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.check_start(s)?;
        s.send(packets::UserauthRequest {
            username: username.into(),
            service: SSH_SERVICE_CONNECTION,
            method: packets::AuthMethod::Password(packets::MethodPassword {
                change: false,
                password: password.into(),
            }),
        })?;
        parse_ctx.cli_auth_type = Some(AuthMethod::Password);
        self.state = AuthState::Request { method: AuthMethod::Password };
        debug!("Sent password request for {username}");
        Ok(())
    }

    pub fn request_pubkey(
        &mut self,
        username: &str,
        key: &SignKey,
        sess_id: &SessId,
        parse_ctx: &mut ParseContext,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.check_start(s)?;

        let pubkey = key.pubkey();
        let sig_algo = Signature::sig_name_for_pubkey(&pubkey)?;
        let msg = packets::AuthSigMsg {
            sess_id: BinString(sess_id),
            username: username.into(),
            service: SSH_SERVICE_CONNECTION,
            sig_algo,
            pubkey: Blob(pubkey.clone()),
        };
        let sig = key.sign(&msg)?;

        s.send(packets::UserauthRequest {
            username: username.into(),
            service: SSH_SERVICE_CONNECTION,
            method: packets::AuthMethod::PubKey(MethodPubKey {
                sig_algo,
                pubkey: Blob(pubkey),
                sig: Some(Blob((&sig).into())),
            }),
        })?;
        parse_ctx.cli_auth_type = Some(AuthMethod::PublicKey);
        self.state = AuthState::Request { method: AuthMethod::PublicKey };
        debug!("Sent publickey request for {username}");
        Ok(())
    }

    fn method_pending(&self) -> Result<AuthMethod> {
        match self.state {
            AuthState::Request { method } => Ok(method),
            _ => {
                trace!("Auth reply with no request, state {:?}", self.state);
                Err(Error::SSHProtoError)
            }
        }
    }

    pub fn service_accept(&mut self, p: &packets::ServiceAccept) -> Result<()> {
        if !self.service_sent || p.name != SSH_SERVICE_USERAUTH {
            debug!("Unexpected service accept \"{}\"", p.name);
            return Err(Error::SSHProtoError);
        }
        Ok(())
    }

    pub fn failure(
        &mut self,
        p: &packets::UserauthFailure,
        parse_ctx: &mut ParseContext,
    ) -> Result<()> {
        let method = self.method_pending()?;
        parse_ctx.cli_auth_type = None;
        let methods = p.methods.to_string();
        if p.partial {
            // Multi-step authentication isn't supported
            debug!("Partial success for {method:?}, further methods {methods}");
        } else {
            debug!("Auth {method:?} failed, server allows {methods}");
        }
        self.state = AuthState::Failed { methods };
        Ok(())
    }

    pub fn success(&mut self, parse_ctx: &mut ParseContext) -> Result<()> {
        let method = self.method_pending()?;
        parse_ctx.cli_auth_type = None;
        info!("Authenticated with {}", method.ssh_name());
        self.state = AuthState::Success { method };
        Ok(())
    }

    pub fn auth60(&mut self, p: &Userauth60, parse_ctx: &mut ParseContext) -> Result<()> {
        self.method_pending()?;
        parse_ctx.cli_auth_type = None;
        match p {
            Userauth60::PwChangeReq(req) => {
                // Changing the password isn't supported.
                debug!("Password change requested: {}", req.prompt.to_lossy());
                self.state = AuthState::PasswordExpired;
                Ok(())
            }
            Userauth60::PkOk(_) => {
                // Only sent in reply to an unsigned query
                trace!("Unexpected pk_ok");
                Err(Error::SSHProtoError)
            }
        }
    }

    pub fn banner(&self, p: &packets::UserauthBanner) {
        info!("Server banner: {}", p.message.to_lossy());
    }
}
