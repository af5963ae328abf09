use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};

/// Describes a logical mesh service.
///
/// A service is identified by its name and optional namespace. Its hostname is derived from that
/// identity; tags and ports describe the service but do not participate in its identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// The set of tags declared by the service.
    ///
    /// An empty set is allowed but tag values must be non-empty.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub ports: PortList,
}

/// A named service port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    /// Classifies ports for a single service. May be empty only when the service declares exactly
    /// one port.
    #[serde(default)]
    pub name: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortList(Vec<Port>);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    #[default]
    Tcp,
    Udp,
}

/// A network endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Typically an IP address.
    pub address: String,

    /// The port on the host address.
    pub port: u16,

    /// The service port this endpoint serves.
    pub service_port: Port,
}

/// Binds an endpoint to a service and a tag.
///
/// If the service has no tags the tag is absent; otherwise it is an element of the service's tag
/// set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub endpoint: Endpoint,
    pub service: Service,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseServiceError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("service tags must not be empty")]
    EmptyTag,
}

// === impl Service ===

impl Service {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            tags: BTreeSet::new(),
            ports: PortList::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl ToString) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_tags<T: ToString>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.to_string()));
        self
    }

    pub fn with_port(mut self, name: impl ToString, port: u16, protocol: Protocol) -> Self {
        self.ports.0.push(Port {
            name: name.to_string(),
            port,
            protocol,
        });
        self
    }

    /// Returns the hostname under which the service is discoverable.
    pub fn hostname(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}.{}", self.name, ns),
            _ => self.name.clone(),
        }
    }

    /// Returns the `(name, namespace)` pair identifying the service.
    pub fn key(&self) -> (&str, Option<&str>) {
        (self.name.as_str(), self.namespace.as_deref())
    }

    pub fn is_tagless(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Renders `name.namespace:tag1,tag2`, with tags sorted.
impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hostname())?;
        let mut tags = self.tags.iter();
        if let Some(first) = tags.next() {
            write!(f, ":{first}")?;
            for tag in tags {
                write!(f, ",{tag}")?;
            }
        }
        Ok(())
    }
}

/// Parses the output of [`Service`]'s `Display` impl. Ports are not represented in this form, so
/// the parsed service declares none.
impl FromStr for Service {
    type Err = ParseServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, tags) = match s.split_once(':') {
            Some((host, tags)) => (host, Some(tags)),
            None => (s, None),
        };

        let (name, namespace) = match host.split_once('.') {
            Some((name, ns)) => (name, Some(ns.to_string())),
            None => (host, None),
        };
        if name.is_empty() {
            return Err(ParseServiceError::EmptyName);
        }

        let mut svc = Service::new(name);
        svc.namespace = namespace;
        if let Some(tags) = tags {
            for tag in tags.split(',') {
                if tag.is_empty() {
                    return Err(ParseServiceError::EmptyTag);
                }
                svc.tags.insert(tag.to_string());
            }
        }
        Ok(svc)
    }
}

// === impl PortList ===

impl PortList {
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|p| p.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Port>> for PortList {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

impl FromIterator<Port> for PortList {
    fn from_iter<I: IntoIterator<Item = Port>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// === impl Protocol ===

impl Protocol {
    /// Indicates whether the proxy may route this protocol at the HTTP layer.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Http2 | Self::Grpc)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "HTTP",
            Self::Http2 => "HTTP2",
            Self::Grpc => "GRPC",
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        })
    }
}

// === impl ServiceInstance ===

impl ServiceInstance {
    /// Indicates whether the instance matches the given port names and tags. Empty filters match
    /// every instance.
    pub fn matches(&self, port_names: &[String], tags: &[String]) -> bool {
        let port_match = port_names.is_empty()
            || port_names
                .iter()
                .any(|name| *name == self.endpoint.service_port.name);
        let tag_match = tags.is_empty()
            || self
                .tag
                .as_ref()
                .map(|tag| tags.contains(tag))
                .unwrap_or(false);
        port_match && tag_match
    }
}
