use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::resource::ResourceHandle;

/// Maps a resource to the two base URLs it can be reached through. Both are
/// treated as opaque prefixes for the agent API.
pub trait AddressResolver: Send + Sync {
    /// Node-local agent address, if the node advertises one.
    fn direct_base(&self, handle: &ResourceHandle) -> Option<Url>;
    /// Cluster-routed address; always available.
    fn proxied_base(&self, handle: &ResourceHandle) -> Url;
}

#[derive(Debug, Clone)]
pub struct StaticAddresses {
    direct: Option<Url>,
    proxied: Url,
}

impl StaticAddresses {
    pub fn new(direct: Option<&str>, proxied: &str) -> StreamResult<Self> {
        Ok(Self {
            direct: direct.map(parse_base).transpose()?,
            proxied: parse_base(proxied)?,
        })
    }

    pub fn proxied_only(proxied: &str) -> StreamResult<Self> {
        Self::new(None, proxied)
    }
}

impl AddressResolver for StaticAddresses {
    fn direct_base(&self, _handle: &ResourceHandle) -> Option<Url> {
        self.direct.clone()
    }

    fn proxied_base(&self, _handle: &ResourceHandle) -> Url {
        self.proxied.clone()
    }
}

fn parse_base(raw: &str) -> StreamResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StreamError::InvalidConfig(
            "agent base url cannot be empty".into(),
        ));
    }
    let url = Url::parse(trimmed)?;
    if url.cannot_be_a_base() {
        return Err(StreamError::InvalidUrl(format!(
            "'{trimmed}' cannot be used as a base url"
        )));
    }
    Ok(url)
}
