//! Authentication: JWT verification, opaque token storage and the REST
//! authentication flow guarding dispatched applications.

mod handler;
mod reader;
mod rest;
mod tokenstore;
mod verifier;
mod writer;

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::config::GlobalAuth;
use crate::dispatcher::Behaviour;

pub use handler::{
    AuthenticatedToken, AuthenticationHandler, InvalidCredentialsError, JwtResponse,
};
pub use reader::{BearerTokenReader, cookie_value};
pub use rest::{RestAuthBehaviour, routes};
pub use tokenstore::{CachedTokenStore, InMemoryTokenStore, MappedToken, TokenStore};
pub use verifier::{Claims, JwtVerifier};
pub use writer::{AuthorizationTokenWriter, HeaderTokenWriter, TokenWriter, writer_for};

/// Creates the authentication behaviour for the configured mode.
pub fn new_auth_behaviour(
    cfg: &GlobalAuth,
    handler: Arc<AuthenticationHandler>,
    store: Arc<dyn TokenStore>,
) -> Result<Arc<dyn Behaviour>> {
    match cfg.mode.as_str() {
        "rest" => Ok(Arc::new(RestAuthBehaviour::new(handler, store))),
        other => bail!("unsupported authentication mode: '{}'", other),
    }
}
