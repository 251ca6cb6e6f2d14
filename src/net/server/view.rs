//! Configuration views and address match lists.
//!
//! A [`View`] is the configuration scope a request is answered under. The
//! client asks a [`ViewMatcher`] for the view matching the request's source
//! and destination address, class and signer, and holds on to it until the
//! request is done.
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use super::recursion::Resolver;
use crate::base::iana::Class;
use crate::base::message::Name;

//------------ Acl -----------------------------------------------------------

/// An address match list.
#[derive(Clone, Debug, Default)]
pub enum Acl {
    /// Matches every address.
    #[default]
    Any,

    /// Matches no address.
    None,

    /// Matches addresses within any of the given networks.
    List(Vec<IpNet>),
}

impl Acl {
    /// Creates a list from networks in their string representation.
    pub fn from_nets<'a>(
        nets: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ipnet::AddrParseError> {
        let nets = nets
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<IpNet>, _>>()?;
        Ok(Acl::List(nets))
    }

    /// Returns whether the address matches the list.
    pub fn allows(&self, addr: IpAddr) -> bool {
        match self {
            Acl::Any => true,
            Acl::None => false,
            Acl::List(nets) => nets.iter().any(|net| net.contains(&addr)),
        }
    }
}

//------------ PeerConfig ----------------------------------------------------

/// Settings for particular peers.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// The peers these settings apply to.
    pub addr: IpNet,

    /// The largest UDP response to send to these peers.
    pub max_udp_size: u16,
}

//------------ View ----------------------------------------------------------

/// A configuration view.
pub struct View {
    name: String,
    class: Class,
    match_clients: Acl,
    match_destinations: Acl,
    match_key: Option<Name>,
    recursion: bool,
    allow_recursion: Acl,
    peers: Vec<PeerConfig>,
    resolver: Option<Arc<dyn Resolver>>,
}

/// # Creation
///
impl View {
    /// Creates a view for the given class matching every request.
    ///
    /// Recursion is off until a resolver is attached.
    pub fn new(name: impl Into<String>, class: Class) -> Self {
        View {
            name: name.into(),
            class,
            match_clients: Acl::Any,
            match_destinations: Acl::Any,
            match_key: None,
            recursion: false,
            allow_recursion: Acl::Any,
            peers: Vec::new(),
            resolver: None,
        }
    }

    pub fn with_match_clients(mut self, acl: Acl) -> Self {
        self.match_clients = acl;
        self
    }

    pub fn with_match_destinations(mut self, acl: Acl) -> Self {
        self.match_destinations = acl;
        self
    }

    /// Restricts the view to requests signed with the given key.
    pub fn with_match_key(mut self, key: Name) -> Self {
        self.match_key = Some(key);
        self
    }

    /// Enables recursion through the given resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self.recursion = true;
        self
    }

    pub fn with_recursion(mut self, recursion: bool) -> Self {
        self.recursion = recursion;
        self
    }

    pub fn with_allow_recursion(mut self, acl: Acl) -> Self {
        self.allow_recursion = acl;
        self
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }
}

/// # Access
///
impl View {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn resolver(&self) -> Option<&Arc<dyn Resolver>> {
        self.resolver.as_ref()
    }

    /// Returns whether a request from `peer` may recurse.
    pub fn recursion_allowed(&self, peer: IpAddr) -> bool {
        self.recursion
            && self.resolver.is_some()
            && self.allow_recursion.allows(peer)
    }

    /// Returns the UDP size limit configured for `peer`, if any.
    pub fn peer_udp_size(&self, peer: IpAddr) -> Option<u16> {
        self.peers
            .iter()
            .find(|cfg| cfg.addr.contains(&peer))
            .map(|cfg| cfg.max_udp_size)
    }

    /// Returns whether a request matches this view.
    pub fn matches(
        &self,
        source: IpAddr,
        dest: Option<IpAddr>,
        class: Class,
        signer: Option<&Name>,
    ) -> bool {
        if class != self.class && class != Class::ANY {
            return false;
        }
        if !self.match_clients.allows(source) {
            return false;
        }
        if let Some(dest) = dest {
            if !self.match_destinations.allows(dest) {
                return false;
            }
        }
        match self.match_key.as_ref() {
            Some(key) => signer == Some(key),
            None => true,
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("recursion", &self.recursion)
            .finish_non_exhaustive()
    }
}

//------------ ViewMatcher ---------------------------------------------------

/// Finds the view a request is to be answered under.
pub trait ViewMatcher: Send + Sync {
    fn find_matching_view(
        &self,
        source: IpAddr,
        dest: Option<IpAddr>,
        class: Class,
        signer: Option<&Name>,
    ) -> Option<Arc<View>>;
}

//------------ ViewList ------------------------------------------------------

/// An ordered list of views picking the first one that matches.
#[derive(Debug, Default)]
pub struct ViewList {
    views: Vec<Arc<View>>,
}

impl ViewList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, view: View) {
        self.views.push(Arc::new(view));
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.push(view);
        self
    }
}

impl ViewMatcher for ViewList {
    fn find_matching_view(
        &self,
        source: IpAddr,
        dest: Option<IpAddr>,
        class: Class,
        signer: Option<&Name>,
    ) -> Option<Arc<View>> {
        self.views
            .iter()
            .find(|view| view.matches(source, dest, class, signer))
            .cloned()
    }
}

//============ Testing =======================================================
