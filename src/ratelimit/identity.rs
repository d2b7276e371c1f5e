//! Identity resolution and key generation.

/// The requester as seen by the transport: its address and, optionally, an
/// access token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Client address as resolved by the transport
    pub ip: String,
    /// Access token; an empty token is treated as absent
    pub token: Option<String>,
}

impl Identity {
    /// An identity without a token.
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            token: None,
        }
    }

    /// Build an identity from transport values.
    ///
    /// An empty token counts as no token. Tokens are kept verbatim otherwise.
    pub fn new(ip: impl Into<String>, token: Option<&str>) -> Self {
        Self {
            ip: ip.into(),
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }
}

/// Which quota applies to an identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaClass {
    /// Keyed by client address, limited by the IP quota
    Ip,
    /// Keyed by access token, limited by the token quota
    Token,
}

impl QuotaClass {
    fn prefix(&self) -> &'static str {
        match self {
            QuotaClass::Ip => "ip:",
            QuotaClass::Token => "token:",
        }
    }
}

/// The namespaced key that scopes all counting and blocking state of one
/// requester.
///
/// A token always wins over the address. IP and token keys carry different
/// prefixes, so an address and a token with the same text never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    class: QuotaClass,
    key: String,
}

impl IdentityKey {
    /// Resolve the key for an identity.
    ///
    /// Any non-empty token selects the token class; an empty one is ignored.
    pub fn resolve(identity: &Identity) -> Self {
        match identity.token.as_deref() {
            Some(token) if !token.is_empty() => Self::new(QuotaClass::Token, token),
            _ => Self::new(QuotaClass::Ip, &identity.ip),
        }
    }

    fn new(class: QuotaClass, value: &str) -> Self {
        Self {
            class,
            key: format!("{}{}", class.prefix(), value),
        }
    }

    /// The quota class selected for this key.
    pub fn class(&self) -> QuotaClass {
        self.class
    }

    /// The namespaced key string handed to the store.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
