//! Inbound request authentication
//!
//! Three outcomes: the origin is blocked (answer 2xx, do nothing), a trusted
//! bridge vouched for the request, or an HTTP signature by a resolvable
//! actor checks out. Failures never write to the store.

use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;
use url::Url;

use super::context::{FederationContext, authority_of};
use super::local_ref::LocalReferenceResolver;
use super::signature::{key_owner, parse_signature_header, verify_signature};
use crate::data::Actor;
use crate::error::AppError;

/// The parts of an inbound HTTP request authentication looks at
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub source_ip: Option<IpAddr>,
}

#[derive(Debug)]
pub enum Verification {
    /// Origin is on the block-list
    Blocked(String),
    /// Trusted bridge gateway; no signer
    Bridged,
    Signed(Actor),
}

#[derive(Clone)]
pub struct SignatureVerifier {
    ctx: Arc<FederationContext>,
    resolver: LocalReferenceResolver,
}

impl SignatureVerifier {
    pub fn new(ctx: Arc<FederationContext>, resolver: LocalReferenceResolver) -> Self {
        Self { ctx, resolver }
    }

    /// Authenticate an inbound request
    ///
    /// # Errors
    /// - `Authentication` for a missing, malformed or invalid signature, an
    ///   unresolvable signer, or a bridge caller outside the allow-list
    /// - `BridgeSourceUnavailable` when the bridge token matches but the
    ///   source address needed for the allow-list is unknown
    pub async fn verify(&self, request: InboundRequest<'_>) -> Result<Verification, AppError> {
        if let Some(origin) = self.blocked_origin(request.headers) {
            return Ok(Verification::Blocked(origin));
        }

        if let Some(verification) = self.check_bridge(&request)? {
            return Ok(verification);
        }

        let signature_header = request
            .headers
            .get("signature")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing Signature header".to_string()))?;
        let parsed = parse_signature_header(signature_header)?;
        let owner = key_owner(&parsed.key_id);

        let signer = self.resolver.resolve_actor(owner).await.map_err(|error| {
            tracing::debug!(key_id = %parsed.key_id, %error, "Signer could not be resolved");
            AppError::Authentication(format!("Unresolvable signer {owner}"))
        })?;

        let body = (!request.body.is_empty()).then_some(request.body);
        verify_signature(
            request.method,
            request.path,
            request.headers,
            body,
            &signer.public_key_pem,
        )?;

        tracing::debug!(signer = %owner, "Signature verified");
        Ok(Verification::Signed(signer))
    }

    /// The first claimed origin that is on the block-list, if any
    pub fn blocked_origin(&self, headers: &HeaderMap) -> Option<String> {
        let origin = self
            .claimed_origins(headers)
            .into_iter()
            .find(|origin| self.ctx.is_blocked_origin(origin))?;
        tracing::info!(origin = %origin, "Dropping request from blocked origin");
        Some(origin)
    }

    /// Every `host[:port]` the request claims to come from: `Origin` and the keyId
    fn claimed_origins(&self, headers: &HeaderMap) -> Vec<String> {
        let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

        let origin = header("origin").and_then(|origin| Url::parse(origin).ok());
        let key_id = header("signature")
            .and_then(|signature| parse_signature_header(signature).ok())
            .and_then(|parsed| Url::parse(&parsed.key_id).ok());

        [origin, key_id]
            .iter()
            .flatten()
            .filter_map(authority_of)
            .collect()
    }

    fn check_bridge(&self, request: &InboundRequest<'_>) -> Result<Option<Verification>, AppError> {
        let Some(bridge) = self.ctx.bridge() else {
            return Ok(None);
        };

        let token = request
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        if token != Some(bridge.token.as_str()) {
            return Ok(None);
        }

        if bridge.allowed_networks.is_empty() {
            return Ok(Some(Verification::Bridged));
        }

        match request.source_ip {
            None => Err(AppError::BridgeSourceUnavailable),
            Some(ip) if bridge.allows(ip) => Ok(Some(Verification::Bridged)),
            Some(ip) => {
                tracing::warn!(%ip, "Bridge token presented from outside the allow-list");
                Err(AppError::Authentication(format!(
                    "Bridge caller {ip} is not allowed"
                )))
            }
        }
    }
}
