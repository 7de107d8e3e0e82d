//! GPU device descriptors

use serde::{Deserialize, Serialize};

use crate::{ClusterError, ClusterResult};

/// Identifier of a device as reported by the discovery collaborator
/// (e.g. "cuda:0", "metal:0", "vulkan:1")
pub type DeviceId = String;

/// Static description of a GPU device, immutable after discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device identifier
    pub id: DeviceId,
    /// Device name
    pub name: String,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Architecture family (e.g. "hopper", "rdna3", "apple-m3")
    pub architecture: String,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Number of compute units (SMs, CUs, cores)
    pub compute_units: u32,
    /// Numeric precisions the device can execute
    pub precisions: Vec<Precision>,
    /// Form factor, used to pick thermal calibration
    #[serde(default)]
    pub device_class: DeviceClass,
    /// Memory bandwidth in GB/s
    #[serde(default)]
    pub memory_bandwidth_gbps: f64,
    /// Host or node the device lives on
    #[serde(default)]
    pub topology_group: Option<String>,
}

impl GpuDevice {
    /// Create a device with the common defaults (FP32/FP16, desktop class)
    pub fn new(id: impl Into<String>, vendor: GpuVendor, memory_total: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            vendor,
            architecture: "unknown".to_string(),
            memory_total,
            compute_units: 1,
            precisions: vec![Precision::Fp32, Precision::Fp16],
            device_class: DeviceClass::Desktop,
            memory_bandwidth_gbps: 0.0,
            topology_group: None,
        }
    }

    /// Whether the device can run the given precision
    pub fn supports(&self, precision: Precision) -> bool {
        self.precisions.contains(&precision)
    }

    /// Check the descriptor before it enters the registry
    pub fn validate(&self) -> ClusterResult<()> {
        if self.id.trim().is_empty() {
            return Err(ClusterError::Validation(
                "device must have a non-empty id".to_string(),
            ));
        }
        if self.memory_total == 0 {
            return Err(ClusterError::Validation(format!(
                "device {} reports zero total memory",
                self.id
            )));
        }
        if !self.memory_bandwidth_gbps.is_finite() || self.memory_bandwidth_gbps < 0.0 {
            return Err(ClusterError::Validation(format!(
                "device {} has invalid memory bandwidth {}",
                self.id, self.memory_bandwidth_gbps
            )));
        }
        Ok(())
    }
}

/// GPU vendor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Qualcomm,
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Qualcomm => write!(f, "Qualcomm"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Device form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Server accelerators with active cooling
    Datacenter,
    /// Discrete consumer GPUs
    #[default]
    Desktop,
    /// Phones and tablets, passively cooled
    Mobile,
    /// iGPUs sharing a package with the CPU
    Integrated,
}

/// Numeric precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp64,
    Fp32,
    Bf16,
    Fp16,
    Int8,
    Int4,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Fp64 => write!(f, "fp64"),
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Bf16 => write!(f, "bf16"),
            Precision::Fp16 => write!(f, "fp16"),
            Precision::Int8 => write!(f, "int8"),
            Precision::Int4 => write!(f, "int4"),
        }
    }
}
