//! Credential resolution and operation authorization.
//!
//! Two credential types are accepted: raw API keys, looked up by their
//! lowercase hex SHA-256 hash, and HS256 JWT bearer tokens. Both resolve to
//! an [`AuthContext`] whose permissions are the union of the permissions of
//! its roles and any permissions granted directly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conduit_core::{AuthContext, AuthMethod, Clock, Credential, Request, required_permission};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::GatewayError;

/// User id of unauthenticated callers.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Lifetime of contexts resolved without a token, which carry no expiry
/// of their own.
fn untimed_context_ttl() -> ChronoDuration {
    ChronoDuration::hours(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// Identity the key authenticates as.
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When false every request runs as an anonymous caller with all
    /// permissions.
    #[serde(default)]
    pub enabled: bool,
    /// Accept requests without credentials as [`ANONYMOUS_USER`], with the
    /// permissions of the `anonymous` role.
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    /// `sha256_hex(raw_key) -> entry`.
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyEntry>,
    /// `role -> permissions`, e.g. `"analyst" = ["cns:*", "marketplace:search"]`.
    #[serde(default = "default_role_permissions")]
    pub role_permissions: HashMap<String, Vec<String>>,
}

fn default_role_permissions() -> HashMap<String, Vec<String>> {
    HashMap::from([("admin".to_owned(), vec!["*".to_owned()])])
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: false,
            jwt_secret: None,
            issuer: None,
            api_keys: HashMap::new(),
            role_permissions: default_role_permissions(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if let Some(secret) = &self.jwt_secret
            && secret.is_empty()
        {
            return Err(GatewayError::Configuration("jwt_secret must not be empty".into()));
        }
        if let Some(hash) = self
            .api_keys
            .keys()
            .find(|h| h.len() != 64 || !h.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(GatewayError::Configuration(format!(
                "api key hash {hash:?} is not a hex sha-256 digest"
            )));
        }
        Ok(())
    }
}

/// Hash a raw API key into the lookup format (lowercase hex SHA-256).
pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Claims of tokens issued and accepted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Permissions granted directly, on top of the roles'.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

pub struct AuthenticationService {
    config: AuthConfig,
    jwt: Option<JwtKeys>,
    clock: Arc<dyn Clock>,
}

impl AuthenticationService {
    pub fn new(config: AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, GatewayError> {
        config.validate()?;
        let jwt = config.jwt_secret.as_deref().map(|secret| {
            let mut validation = Validation::new(Algorithm::HS256);
            // Expiry is checked against the injected clock instead.
            validation.validate_exp = false;
            validation.set_required_spec_claims(&["exp", "sub"]);
            if let Some(issuer) = &config.issuer {
                validation.set_issuer(&[issuer]);
            }
            JwtKeys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
                validation,
            }
        });
        Ok(Self { config, jwt, clock })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Resolve the caller of `request`.
    pub fn authenticate(&self, request: &Request) -> Result<AuthContext, GatewayError> {
        let now = self.clock.utc();
        if !self.config.enabled {
            return Ok(unrestricted(request, now));
        }

        let context = match &request.metadata.credential {
            Some(Credential::ApiKey(raw)) => self.authenticate_api_key(raw, request, now)?,
            Some(Credential::Bearer(token)) => self.authenticate_token(token)?,
            None if self.config.allow_anonymous => self.context(
                ANONYMOUS_USER.to_owned(),
                request.metadata.session_id.clone(),
                [ANONYMOUS_USER.to_owned()],
                Vec::new(),
                Vec::new(),
                now + untimed_context_ttl(),
                AuthMethod::Anonymous,
            ),
            None => return Err(GatewayError::Authentication("missing credentials".into())),
        };

        if context.is_expired(now) {
            return Err(GatewayError::Authentication("credentials expired".into()));
        }
        debug!(user_id = %context.user_id, method = %context.method, "caller authenticated");
        Ok(context)
    }

    /// Require the `<system>:<action>` permission of `operation`.
    pub fn authorize(&self, context: &AuthContext, operation: &str) -> Result<(), GatewayError> {
        if context.can_invoke(operation) {
            return Ok(());
        }
        warn!(user_id = %context.user_id, operation, "permission denied");
        Err(GatewayError::Authentication(format!(
            "missing permission {}",
            required_permission(operation)
        )))
    }

    /// Mint a bearer token valid for `ttl`.
    pub fn issue_token(
        &self,
        user_id: &str,
        roles: &[&str],
        ttl: std::time::Duration,
    ) -> Result<String, GatewayError> {
        let keys = self
            .jwt
            .as_ref()
            .ok_or_else(|| GatewayError::Configuration("jwt_secret is not configured".into()))?;
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|e| GatewayError::Configuration(format!("token ttl out of range: {e}")))?;
        let claims = Claims {
            sub: user_id.to_owned(),
            sid: Some(uuid::Uuid::new_v4().to_string()),
            roles: roles.iter().map(|r| (*r).to_owned()).collect(),
            scopes: Vec::new(),
            permissions: Vec::new(),
            exp: (self.clock.utc() + ttl).timestamp(),
            iss: self.config.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| GatewayError::Configuration(format!("token encoding failed: {e}")))
    }

    fn authenticate_api_key(
        &self,
        raw: &str,
        request: &Request,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, GatewayError> {
        let entry = self
            .config
            .api_keys
            .get(&hash_api_key(raw))
            .ok_or_else(|| GatewayError::Authentication("unknown api key".into()))?;
        Ok(self.context(
            entry.user_id.clone(),
            request.metadata.session_id.clone(),
            entry.roles.iter().cloned(),
            Vec::new(),
            Vec::new(),
            now + untimed_context_ttl(),
            AuthMethod::ApiKey,
        ))
    }

    fn authenticate_token(&self, token: &str) -> Result<AuthContext, GatewayError> {
        let keys = self
            .jwt
            .as_ref()
            .ok_or_else(|| GatewayError::Authentication("bearer tokens are not accepted".into()))?;
        let claims = decode::<Claims>(token, &keys.decoding, &keys.validation)
            .map_err(|e| GatewayError::Authentication(format!("invalid token: {e}")))?
            .claims;
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| GatewayError::Authentication("invalid token expiry".into()))?;
        Ok(self.context(
            claims.sub,
            claims.sid,
            claims.roles,
            claims.scopes,
            claims.permissions,
            expires_at,
            AuthMethod::Jwt,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn context(
        &self,
        user_id: String,
        session_id: Option<String>,
        roles: impl IntoIterator<Item = String>,
        scopes: Vec<String>,
        direct: Vec<String>,
        expires_at: DateTime<Utc>,
        method: AuthMethod,
    ) -> AuthContext {
        let roles: BTreeSet<String> = roles.into_iter().collect();
        let mut permissions: BTreeSet<String> = direct.into_iter().collect();
        for role in &roles {
            if let Some(granted) = self.config.role_permissions.get(role) {
                permissions.extend(granted.iter().cloned());
            }
        }
        AuthContext {
            user_id,
            session_id,
            permissions,
            roles,
            scopes: scopes.into_iter().collect(),
            expires_at,
            method,
        }
    }
}

fn unrestricted(request: &Request, now: DateTime<Utc>) -> AuthContext {
    AuthContext {
        user_id: request
            .metadata
            .user_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_USER.to_owned()),
        session_id: request.metadata.session_id.clone(),
        permissions: BTreeSet::from(["*".to_owned()]),
        roles: BTreeSet::new(),
        scopes: BTreeSet::new(),
        expires_at: now + untimed_context_ttl(),
        method: AuthMethod::Anonymous,
    }
}

impl std::fmt::Debug for AuthenticationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationService")
            .field("enabled", &self.config.enabled)
            .field("allow_anonymous", &self.config.allow_anonymous)
            .field("api_keys", &self.config.api_keys.len())
            .field("jwt", &self.jwt.is_some())
            .finish()
    }
}
