//! Remote hosts addressed by the shell

/// A host scripts are uploaded to and run on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    /// Provider id of the server
    pub id: String,
    /// Address the transport connects to (usually the private ip)
    pub address: String,
    /// Fully-qualified name, used in log lines
    pub fqdn: String,
}

impl RemoteTarget {
    /// Create a new target
    pub fn new(id: impl Into<String>, address: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            fqdn: fqdn.into(),
        }
    }
}
