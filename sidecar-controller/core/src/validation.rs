use crate::{Service, ServiceInstance};
use regex::Regex;
use std::{collections::HashSet, fmt, sync::OnceLock};

const DNS1123_LABEL_MAX_LENGTH: usize = 63;

/// Lists every problem found while validating a service.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid service {service}: {}", Problems(.problems))]
pub struct InvalidService {
    pub service: String,
    pub problems: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidInstance {
    #[error("instance {address} of {service}: {source}")]
    Service {
        address: String,
        service: String,
        #[source]
        source: InvalidService,
    },

    #[error("instance {address} of {service} must declare one of the service's tags")]
    MissingTag { address: String, service: String },

    #[error("instance {address} of {service} declares tag {tag:?} on a tagless service")]
    UnexpectedTag {
        address: String,
        service: String,
        tag: String,
    },

    #[error("instance {address} of {service} declares unknown tag {tag:?}")]
    UnknownTag {
        address: String,
        service: String,
        tag: String,
    },

    #[error("instance {address} of {service} serves undeclared port {port:?}")]
    UnknownPort {
        address: String,
        service: String,
        port: String,
    },
}

struct Problems<'a>(&'a [String]);

/// Checks that `value` is a lowercase RFC 1123 DNS label.
pub fn is_dns1123_label(value: &str) -> bool {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let re = LABEL.get_or_init(|| {
        Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("DNS-1123 label regex must compile")
    });
    value.len() <= DNS1123_LABEL_MAX_LENGTH && re.is_match(value)
}

// === impl Service ===

impl Service {
    /// Ensures the service is well-defined.
    pub fn validate(&self) -> Result<(), InvalidService> {
        let mut problems = Vec::new();

        if !is_dns1123_label(&self.name) {
            problems.push(format!("invalid name: {:?}", self.name));
        }
        if let Some(ns) = self.namespace.as_deref() {
            if !ns.is_empty() && !is_dns1123_label(ns) {
                problems.push(format!("invalid namespace: {ns:?}"));
            }
        }
        for tag in &self.tags {
            if !is_dns1123_label(tag) {
                problems.push(format!("invalid service tag: {tag:?}"));
            }
        }

        if self.ports.is_empty() {
            problems.push("service must have at least one declared port".to_string());
        }
        let mut names = HashSet::new();
        let mut numbers = HashSet::new();
        for port in &self.ports {
            if !numbers.insert(port.port) {
                problems.push(format!("duplicate port: {}", port.port));
            }
            if port.name.is_empty() {
                if self.ports.len() > 1 {
                    problems.push(
                        "empty port names are not allowed for services with multiple ports"
                            .to_string(),
                    );
                }
            } else if !is_dns1123_label(&port.name) {
                problems.push(format!("invalid port name: {:?}", port.name));
            } else if !names.insert(port.name.as_str()) {
                problems.push(format!("duplicate port name: {:?}", port.name));
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        Err(InvalidService {
            service: self.hostname(),
            problems,
        })
    }
}

// === impl ServiceInstance ===

impl ServiceInstance {
    /// Ensures the instance's service is well-defined and that the instance's tag and port are
    /// declared by that service.
    pub fn validate(&self) -> Result<(), InvalidInstance> {
        let address = || self.endpoint.address.clone();
        let service = || self.service.hostname();

        self.service
            .validate()
            .map_err(|source| InvalidInstance::Service {
                address: address(),
                service: service(),
                source,
            })?;

        match self.tag.as_deref() {
            None | Some("") if !self.service.is_tagless() => {
                return Err(InvalidInstance::MissingTag {
                    address: address(),
                    service: service(),
                })
            }
            None | Some("") => {}
            Some(tag) if self.service.is_tagless() => {
                return Err(InvalidInstance::UnexpectedTag {
                    address: address(),
                    service: service(),
                    tag: tag.to_string(),
                })
            }
            Some(tag) if !self.service.tags.contains(tag) => {
                return Err(InvalidInstance::UnknownTag {
                    address: address(),
                    service: service(),
                    tag: tag.to_string(),
                })
            }
            Some(_) => {}
        }

        if !self.service.ports.iter().any(|p| *p == self.endpoint.service_port) {
            return Err(InvalidInstance::UnknownPort {
                address: address(),
                service: service(),
                port: self.endpoint.service_port.name.clone(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Problems<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut problems = self.0.iter();
        if let Some(first) = problems.next() {
            f.write_str(first)?;
            for problem in problems {
                write!(f, "; {problem}")?;
            }
        }
        Ok(())
    }
}
