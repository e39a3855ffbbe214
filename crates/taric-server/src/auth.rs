use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use ipnetwork::IpNetwork;
use taric_crypto::hash_api_key;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// What a request wants to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Query the index, download files.
    Read,
    /// Upload, remove, rebuild.
    Write,
}

impl Access {
    pub fn for_method(method: &Method) -> Self {
        if method == Method::GET || method == Method::HEAD {
            Self::Read
        } else {
            Self::Write
        }
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Key digests and client networks allowed one kind of access.
#[derive(Clone, Debug, Default)]
pub struct AccessList {
    key_digests: HashSet<String>,
    networks: Option<Vec<IpNetwork>>,
}

impl AccessList {
    pub fn new(key_digests: impl IntoIterator<Item = String>, networks: Option<Vec<IpNetwork>>) -> Self {
        Self {
            key_digests: key_digests.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
            networks,
        }
    }

    /// Build from configured digests and CIDR strings.
    pub fn parse(key_digests: &[String], networks: Option<&[String]>) -> ServerResult<Self> {
        let networks = networks
            .map(|list| {
                list.iter()
                    .map(|cidr| {
                        IpNetwork::from_str(cidr)
                            .map_err(|e| ServerError::Config(format!("invalid network {cidr:?}: {e}")))
                    })
                    .collect::<ServerResult<Vec<_>>>()
            })
            .transpose()?;
        Ok(Self::new(key_digests.iter().cloned(), networks))
    }

    /// An absent key, or one whose digest is not listed, is refused.
    pub fn allows_key(&self, presented: Option<&str>) -> bool {
        presented.is_some_and(|key| self.key_digests.contains(&hash_api_key(key)))
    }

    /// Without configured networks every address passes. Otherwise at
    /// least one of `addrs` must fall inside one of them.
    pub fn allows_addrs(&self, addrs: &[IpAddr]) -> bool {
        match &self.networks {
            None => true,
            Some(networks) => addrs
                .iter()
                .any(|addr| networks.iter().any(|net| net.contains(*addr))),
        }
    }
}

/// Request gate: API key AND client address, per [`Access`] kind.
#[derive(Clone, Debug)]
pub struct Gate {
    read: AccessList,
    write: AccessList,
    trusted_hops: usize,
}

impl Gate {
    pub fn new(read: AccessList, write: AccessList, trusted_hops: usize) -> Self {
        Self {
            read,
            write,
            trusted_hops: trusted_hops.max(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        Ok(Self::new(
            AccessList::parse(&config.api_keys, config.whitelist.as_deref())?,
            AccessList::parse(&config.api_keys_upload, config.whitelist_upload.as_deref())?,
            config.trusted_hops,
        ))
    }

    pub fn access_list(&self, access: Access) -> &AccessList {
        match access {
            Access::Read => &self.read,
            Access::Write => &self.write,
        }
    }

    pub fn check(&self, access: Access, api_key: Option<&str>, addrs: &[IpAddr]) -> bool {
        let list = self.access_list(access);
        let key_ok = list.allows_key(api_key);
        let addr_ok = list.allows_addrs(addrs);
        if !key_ok {
            warn!(%access, "request refused: api key not recognised");
        } else if !addr_ok {
            warn!(%access, ?addrs, "request refused: client address not allowed");
        }
        key_ok && addr_ok
    }

    /// Client addresses for a request.
    ///
    /// `X-Forwarded-For` wins over the socket peer. Only the last
    /// `trusted_hops` entries are kept; earlier ones are client-controlled.
    pub fn client_addrs(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Vec<IpAddr> {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty());

        let Some(forwarded) = forwarded else {
            return peer.map(|p| p.ip()).into_iter().collect();
        };

        let mut entries: Vec<&str> = forwarded.split(',').map(str::trim).collect();
        if entries.len() > self.trusted_hops {
            warn!(
                header = forwarded,
                kept = self.trusted_hops,
                "X-Forwarded-For has too many entries, ignoring the earliest"
            );
            entries.drain(..entries.len() - self.trusted_hops);
        }
        entries
            .into_iter()
            .filter_map(|entry| match IpAddr::from_str(entry) {
                Ok(addr) => Some(addr),
                Err(_) => {
                    debug!(entry, "ignoring unparseable forwarded address");
                    None
                }
            })
            .collect()
    }
}

/// Middleware: refuse the request with 403 unless the gate allows it.
///
/// GET and HEAD need read access, every other method write access.
pub async fn require_access(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let access = Access::for_method(req.method());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let addrs = state.gate().client_addrs(req.headers(), peer);
    let api_key = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    if !state.gate().check(access, api_key, &addrs) {
        return Err(ServerError::Unauthorised);
    }
    Ok(next.run(req).await)
}
