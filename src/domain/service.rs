//! Service domain types
//!
//! A service is an independently buildable and deployable unit, identified
//! by its short name and version.

use serde::{Deserialize, Serialize};

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

impl PortProtocol {
    /// Protocol name as Kubernetes expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// Mapping from an externally exposed port to a container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub exposed_port: i32,
    pub target_port: i32,
    #[serde(default)]
    pub protocol: PortProtocol,
}

impl ServicePort {
    #[allow(dead_code)]
    pub fn tcp(exposed_port: i32, target_port: i32) -> Self {
        Self {
            exposed_port,
            target_port,
            protocol: PortProtocol::Tcp,
        }
    }
}

/// Network interface of a service, exposed as one Kubernetes Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInterface {
    pub name: String,
    #[serde(default = "default_transport_protocol")]
    pub transport_protocol: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

fn default_transport_protocol() -> String {
    "TCP".to_string()
}

impl ServiceInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport_protocol: default_transport_protocol(),
            ports: Vec::new(),
        }
    }

    /// Builder: add a port mapping
    #[allow(dead_code)]
    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }
}

/// Reference to another service by identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub short_name: String,
    pub version: String,
}

impl ServiceRef {
    pub fn new(short_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.short_name, self.version)
    }
}

/// Service definition with build source and interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub short_name: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Git clone URL of the source repository
    #[serde(default)]
    pub git_clone_url: Option<String>,
    /// Path of the build file inside the repository
    #[serde(default = "default_build_file")]
    pub build_file: String,
    /// Container image, set after a successful build
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<ServiceInterface>,
    #[serde(default)]
    pub kafka_enabled: bool,
    #[serde(default)]
    pub dependencies: Vec<ServiceRef>,
}

fn default_build_file() -> String {
    "Dockerfile".to_string()
}

impl Service {
    pub fn new(short_name: impl Into<String>, version: impl Into<String>) -> Self {
        let short_name = short_name.into();
        Self {
            name: short_name.clone(),
            short_name,
            version: version.into(),
            description: String::new(),
            git_clone_url: None,
            build_file: default_build_file(),
            image: None,
            interfaces: Vec::new(),
            kafka_enabled: false,
            dependencies: Vec::new(),
        }
    }

    /// Identity of this service
    pub fn reference(&self) -> ServiceRef {
        ServiceRef::new(&self.short_name, &self.version)
    }

    /// Builder: set git source
    #[allow(dead_code)]
    pub fn with_git(mut self, url: impl Into<String>) -> Self {
        self.git_clone_url = Some(url.into());
        self
    }

    /// Builder: set image
    #[allow(dead_code)]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Builder: add an interface
    #[allow(dead_code)]
    pub fn with_interface(mut self, interface: ServiceInterface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Builder: enable/disable Kafka
    #[allow(dead_code)]
    pub fn with_kafka(mut self, enabled: bool) -> Self {
        self.kafka_enabled = enabled;
        self
    }
}
