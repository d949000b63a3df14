//! Immutable federation settings shared by every federation component
//!
//! Built once from [`AppConfig`] and handed around as `Arc<FederationContext>`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use url::Url;

use crate::config::AppConfig;
use crate::data::{Actor, EntityId, Note};
use crate::error::AppError;

/// Bridge gateway trust settings
#[derive(Debug, Clone)]
pub struct BridgeTrust {
    pub token: String,
    /// Empty means any source address
    pub allowed_networks: Vec<IpNetwork>,
}

impl BridgeTrust {
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allowed_networks.iter().any(|network| network.contains(ip))
    }
}

/// Delivery queue tuning
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub max_concurrency: usize,
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

/// Where a URI points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriKind {
    /// Same origin as this instance
    Local(Url),
    Remote(Url),
}

/// Local entity families addressable by URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEntity {
    Actor,
    Note,
}

impl LocalEntity {
    fn path_segment(&self) -> &'static str {
        match self {
            Self::Actor => "users",
            Self::Note => "notes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederationContext {
    /// Base URL without trailing slash
    base_url: String,
    origin: url::Origin,
    blocked_origins: HashSet<String>,
    bridge: Option<BridgeTrust>,
    delivery: DeliverySettings,
    allow_private_addresses: bool,
}

impl FederationContext {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let base = Url::parse(&config.server.base_url())
            .map_err(|e| AppError::Config(format!("invalid server base url: {e}")))?;

        let federation = &config.federation;
        let bridge = if federation.bridge.enabled {
            let token = federation
                .bridge
                .token
                .clone()
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| {
                    AppError::Config("federation.bridge.token is required".to_string())
                })?;
            let allowed_networks = federation
                .bridge
                .allowed_ips
                .iter()
                .map(|network| {
                    network.parse::<IpNetwork>().map_err(|e| {
                        AppError::Config(format!("invalid bridge network {network:?}: {e}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(BridgeTrust {
                token,
                allowed_networks,
            })
        } else {
            None
        };

        let delivery = DeliverySettings {
            max_concurrency: federation.delivery.max_concurrency.max(1),
            attempt_timeout: Duration::from_secs(federation.delivery.timeout_seconds),
            max_attempts: federation.delivery.max_attempts.max(1),
            base_backoff: Duration::from_millis(federation.delivery.base_backoff_millis),
        };

        Ok(Self {
            base_url: base.as_str().trim_end_matches('/').to_string(),
            origin: base.origin(),
            blocked_origins: federation
                .blocked_origins
                .iter()
                .map(|origin| origin.trim().to_ascii_lowercase())
                .filter(|origin| !origin.is_empty())
                .collect(),
            bridge,
            delivery,
            allow_private_addresses: federation.allow_private_addresses,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn bridge(&self) -> Option<&BridgeTrust> {
        self.bridge.as_ref()
    }

    pub fn delivery(&self) -> &DeliverySettings {
        &self.delivery
    }

    pub fn allow_private_addresses(&self) -> bool {
        self.allow_private_addresses
    }

    /// Whether traffic from `authority` (`host[:port]`) must be dropped
    pub fn is_blocked_origin(&self, authority: &str) -> bool {
        let authority = authority.trim().to_ascii_lowercase();
        if self.blocked_origins.contains(&authority) {
            return true;
        }
        // A bare host entry blocks every port on that host
        authority
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .is_some_and(|(host, _)| self.blocked_origins.contains(host))
    }

    /// Classify `uri` as local or remote
    ///
    /// # Errors
    /// `MalformedUri` when `uri` is not an absolute http(s) URL.
    pub fn classify(&self, uri: &str) -> Result<UriKind, AppError> {
        let url = Url::parse(uri).map_err(|_| AppError::MalformedUri(uri.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(AppError::MalformedUri(uri.to_string()));
        }

        if url.origin() == self.origin {
            Ok(UriKind::Local(url))
        } else {
            Ok(UriKind::Remote(url))
        }
    }

    /// Extract the id from a local `{base}/users/{id}` or `{base}/notes/{id}` URL
    pub fn local_id(&self, url: &Url, entity: LocalEntity) -> Result<EntityId, AppError> {
        let malformed = || AppError::MalformedUri(url.to_string());
        let mut segments = url.path_segments().ok_or_else(malformed)?;

        match (segments.next(), segments.next(), segments.next()) {
            (Some(prefix), Some(raw_id), None) if prefix == entity.path_segment() => {
                EntityId::parse(raw_id).ok_or_else(malformed)
            }
            _ => Err(malformed()),
        }
    }

    // =========================================================================
    // Canonical URIs
    // =========================================================================

    pub fn local_actor_uri(&self, id: &str) -> String {
        format!("{}/users/{}", self.base_url, id)
    }

    pub fn local_note_uri(&self, id: &str) -> String {
        format!("{}/notes/{}", self.base_url, id)
    }

    pub fn local_inbox_uri(&self, actor_id: &str) -> String {
        format!("{}/inbox", self.local_actor_uri(actor_id))
    }

    /// Stored uri for remote actors, derived uri for local ones
    pub fn actor_uri(&self, actor: &Actor) -> String {
        actor
            .uri
            .clone()
            .unwrap_or_else(|| self.local_actor_uri(&actor.id))
    }

    pub fn note_uri(&self, note: &Note) -> String {
        note.uri
            .clone()
            .unwrap_or_else(|| self.local_note_uri(&note.id))
    }

    pub fn key_id(&self, actor: &Actor) -> String {
        format!("{}#main-key", self.actor_uri(actor))
    }

    /// Refuse destinations on loopback/private networks unless explicitly allowed
    pub async fn ensure_reachable(&self, url: &Url) -> Result<(), AppError> {
        if self.allow_private_addresses {
            return Ok(());
        }

        let host = url
            .host_str()
            .ok_or_else(|| AppError::MalformedUri(url.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if host == "localhost" || host.ends_with(".localhost") {
            return Err(AppError::RemoteFetch(format!("refusing local host {host}")));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if is_disallowed_ip(ip) {
                Err(AppError::RemoteFetch(format!("refusing private address {ip}")))
            } else {
                Ok(())
            };
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addresses = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| AppError::RemoteFetch(format!("failed to resolve {host}: {e}")))?;

        let mut resolved_any = false;
        for address in addresses {
            resolved_any = true;
            if is_disallowed_ip(address.ip()) {
                return Err(AppError::RemoteFetch(format!(
                    "{host} resolves to private address {}",
                    address.ip()
                )));
            }
        }
        if !resolved_any {
            return Err(AppError::RemoteFetch(format!("no DNS records for {host}")));
        }

        Ok(())
    }
}

/// `host[:port]` of `url`, the key instances and block-list entries use
pub fn authority_of(url: &Url) -> Option<String> {
    crate::federation::signature::host_header_value(url).map(|a| a.to_ascii_lowercase())
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}
