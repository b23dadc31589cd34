//! Core type definitions for the inference worker

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a model variant, e.g. `resnet50_4`.
///
/// The trailing `_N` token encodes how many CPU cores an instance of the
/// variant needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelVariant(String);

impl ModelVariant {
    /// Create a variant, rejecting empty names
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("model variant name cannot be empty"));
        }
        if name.contains('/') {
            return Err(Error::invalid_argument(format!(
                "model variant name cannot contain '/': {}",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource units encoded in the trailing `_N` suffix.
    ///
    /// Reads the digits following the last underscore and stops at the first
    /// non-digit. Falls back to 1 when there is no underscore, no leading
    /// digit, a zero, or an overflow.
    pub fn resource_units(&self) -> u32 {
        let Some((_, suffix)) = self.0.rsplit_once('_') else {
            return 1;
        };
        let digits: String = suffix.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u32>() {
            Ok(0) | Err(_) => 1,
            Ok(units) => units,
        }
    }

    /// Whether the variant asks for a GPU build of its backend
    pub fn wants_gpu(&self) -> bool {
        self.0.contains("gpu")
    }

    /// Whether the variant asks for half-precision math
    pub fn is_half_precision(&self) -> bool {
        self.0.contains("fp16")
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ModelVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ModelVariant {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ModelVariant> for String {
    fn from(variant: ModelVariant) -> Self {
        variant.0
    }
}

/// Name of a backend instance. Also used as the container name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("instance name cannot be empty"));
        }
        Ok(Self(name))
    }

    /// Default instance name of an online variant
    pub fn for_variant(variant: &ModelVariant) -> Self {
        Self(variant.as_str().to_string())
    }

    /// Instance name of an offline job: `<variant>_<submitter>`
    pub fn scoped(variant: &ModelVariant, submitter: &str) -> Result<Self> {
        if submitter.is_empty() || submitter.contains('/') {
            return Err(Error::invalid_argument(format!(
                "invalid submitter '{}' for {}",
                submitter, variant
            )));
        }
        Ok(Self(format!("{}_{}", variant, submitter)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstanceName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<InstanceName> for String {
    fn from(name: InstanceName) -> Self {
        name.0
    }
}

/// Identifier of this worker as known to the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random WorkerId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which pool an instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingMode {
    /// Latency-sensitive single queries
    Online,
    /// Bulk jobs driven by the offline pipeline
    Offline,
}

impl ServingMode {
    pub fn is_online(&self) -> bool {
        matches!(self, ServingMode::Online)
    }
}

impl fmt::Display for ServingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServingMode::Online => write!(f, "online"),
            ServingMode::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for ServingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "online" => Ok(ServingMode::Online),
            "offline" => Ok(ServingMode::Offline),
            _ => Err(Error::invalid_argument(format!("unknown serving mode: {}", s))),
        }
    }
}

/// Wire protocol a backend kind speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProtocol {
    /// Binary RPC (`worker.backend.v1.Query`)
    Grpc,
    /// HTTP JSON `:predict`
    Rest,
}

/// Backend families an instance can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    PyTorch,
    TensorFlowCpu,
    Gnmt,
}

impl BackendKind {
    pub fn protocol(&self) -> BackendProtocol {
        match self {
            BackendKind::PyTorch | BackendKind::Gnmt => BackendProtocol::Grpc,
            BackendKind::TensorFlowCpu => BackendProtocol::Rest,
        }
    }

    pub fn all() -> [BackendKind; 3] {
        [BackendKind::PyTorch, BackendKind::TensorFlowCpu, BackendKind::Gnmt]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::PyTorch => write!(f, "pytorch"),
            BackendKind::TensorFlowCpu => write!(f, "tensorflow-cpu"),
            BackendKind::Gnmt => write!(f, "gnmt-nvpy"),
        }
    }
}

/// Parses the `framework` metadata field
impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let framework = s.trim().to_lowercase();
        match framework.as_str() {
            "pytorch" => Ok(BackendKind::PyTorch),
            "tensorflow-cpu" => Ok(BackendKind::TensorFlowCpu),
            _ if framework.contains("gnmt-nvpy") => Ok(BackendKind::Gnmt),
            _ => Err(Error::unsupported(format!("backend framework '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_units() {
        let units = |name: &str| ModelVariant::new(name).unwrap().resource_units();
        assert_eq!(units("resnet50_4"), 4);
        assert_eq!(units("resnet50_16"), 16);
        assert_eq!(units("inception_v3_2"), 2);
        assert_eq!(units("resnet50_8cores"), 8);
        assert_eq!(units("mobilenet"), 1);
        assert_eq!(units("mobilenet_v"), 1);
        assert_eq!(units("mobilenet_0"), 1);
        assert_eq!(units("model_99999999999999"), 1);
    }

    #[test]
    fn test_variant_validation() {
        assert!(ModelVariant::new("").is_err());
        assert!(ModelVariant::new("   ").is_err());
        assert!(ModelVariant::new("a/b").is_err());
        assert!("resnet50_4".parse::<ModelVariant>().is_ok());
    }

    #[test]
    fn test_variant_flags() {
        let gnmt = ModelVariant::new("gnmt_gpu_fp16_5").unwrap();
        assert!(gnmt.wants_gpu());
        assert!(gnmt.is_half_precision());
        assert_eq!(gnmt.resource_units(), 5);
    }

    #[test]
    fn test_instance_names() {
        let variant = ModelVariant::new("resnet50_4").unwrap();
        assert_eq!(InstanceName::for_variant(&variant).as_str(), "resnet50_4");
        assert_eq!(
            InstanceName::scoped(&variant, "alice").unwrap().as_str(),
            "resnet50_4_alice"
        );
        assert!(InstanceName::scoped(&variant, "").is_err());
        assert!(InstanceName::new("").is_err());
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("pytorch".parse::<BackendKind>().unwrap(), BackendKind::PyTorch);
        assert_eq!(
            "tensorflow-cpu".parse::<BackendKind>().unwrap(),
            BackendKind::TensorFlowCpu
        );
        assert_eq!("gnmt-nvpy-v2".parse::<BackendKind>().unwrap(), BackendKind::Gnmt);
        assert!(matches!(
            "onnx".parse::<BackendKind>(),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(BackendKind::TensorFlowCpu.protocol(), BackendProtocol::Rest);
    }

    #[test]
    fn test_serving_mode_roundtrip() {
        for mode in [ServingMode::Online, ServingMode::Offline] {
            assert_eq!(mode.to_string().parse::<ServingMode>().unwrap(), mode);
        }
        let json = serde_json::to_string(&ServingMode::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }
}
