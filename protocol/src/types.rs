use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Declares a name-based identifier whose equality, hashing and ordering
/// ignore ASCII case. The original spelling is kept for display.
macro_rules! name_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name {
            name: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self { name: name.into() }
            }

            pub fn name(&self) -> &str {
                &self.name
            }

            fn folded(&self) -> impl Iterator<Item = u8> + '_ {
                self.name.bytes().map(|b| b.to_ascii_lowercase())
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.name.eq_ignore_ascii_case(&other.name)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                for b in self.folded() {
                    state.write_u8(b);
                }
                state.write_u8(0xff);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.folded().cmp(other.folded())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.name)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self::new(name)
            }
        }
    };
}

name_identifier!(
    /// A node in the network. Created once when the topology is built.
    NodeIdentifier
);

name_identifier!(
    /// A named group of nodes that resource summaries roll up to.
    RegionIdentifier
);

name_identifier!(
    /// A deployable service.
    ServiceIdentifier
);

name_identifier!(
    /// A running (or once-running) instance of a service on a node.
    ContainerIdentifier
);

/// Key of one entry in the gossip state map: the position in the kernel's
/// program that produced the value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodePath(pub String);

impl CodePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }
}

impl fmt::Display for CodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodePath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

/// A value carried in the gossip state map.
///
/// The set of shapes is closed so that both the verbose and the compact
/// serializer can carry it without a self-describing format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<GossipValue>),
    Map(BTreeMap<String, GossipValue>),
}

impl GossipValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            GossipValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            GossipValue::Float(v) => Some(*v),
            GossipValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<i64> for GossipValue {
    fn from(v: i64) -> Self {
        GossipValue::Int(v)
    }
}

impl From<f64> for GossipValue {
    fn from(v: f64) -> Self {
        GossipValue::Float(v)
    }
}

impl From<&str> for GossipValue {
    fn from(v: &str) -> Self {
        GossipValue::Text(v.to_string())
    }
}

/// The state map one node shares with its neighbors each round.
pub type SharePayload = BTreeMap<CodePath, GossipValue>;

/// Where a node can be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<std::net::SocketAddr> for NodeAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_ignore_case() {
        let a = NodeIdentifier::new("ServerA");
        let b = NodeIdentifier::new("servera");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));

        // display keeps the original spelling
        assert_eq!(a.to_string(), "ServerA");
    }

    #[test]
    fn test_identifier_ordering() {
        let mut ids = vec![
            RegionIdentifier::new("C"),
            RegionIdentifier::new("a"),
            RegionIdentifier::new("B"),
        ];
        ids.sort();
        let names: Vec<_> = ids.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "B", "C"]);
    }

    #[test]
    fn test_identifier_serializes_as_plain_string() {
        let id = ServiceIdentifier::new("web");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"web\"");
    }
}
