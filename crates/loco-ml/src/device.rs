//! Compute device detection and selection
//!
//! GPU detection only decides the device the engine reports; inference runs
//! on the CPU reference path either way.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Tier;
use crate::error::{MlError, MlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    Cuda,
    Metal,
    Vulkan,
}

impl GpuBackend {
    pub fn name(&self) -> &'static str {
        match self {
            GpuBackend::Cuda => "cuda",
            GpuBackend::Metal => "metal",
            GpuBackend::Vulkan => "vulkan",
        }
    }
}

/// What the host can offer for GPU execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuCapability {
    None,
    Basic(GpuBackend),
    High(GpuBackend),
}

impl GpuCapability {
    pub fn backend(&self) -> Option<GpuBackend> {
        match self {
            GpuCapability::None => None,
            GpuCapability::Basic(b) | GpuCapability::High(b) => Some(*b),
        }
    }
}

/// An acquired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub backend: Option<GpuBackend>,
    pub name: String,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            backend: None,
            name: format!("cpu ({} threads)", num_cpus::get()),
        }
    }

    pub fn gpu(backend: GpuBackend) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            backend: Some(backend),
            name: format!("gpu ({})", backend.name()),
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Host device discovery
pub trait DeviceProbe: Send + Sync {
    fn gpu_capability(&self) -> GpuCapability;

    fn acquire(&self, kind: DeviceKind) -> MlResult<Device>;
}

/// Detects GPUs from the environment
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    fn has_cuda() -> bool {
        std::env::var_os("CUDA_PATH").is_some() || Path::new("/usr/local/cuda").exists()
    }

    fn has_metal() -> bool {
        cfg!(target_os = "macos")
    }

    fn has_vulkan() -> bool {
        std::env::var_os("VK_ICD_FILENAMES").is_some()
    }
}

impl DeviceProbe for SystemProbe {
    fn gpu_capability(&self) -> GpuCapability {
        if Self::has_cuda() {
            GpuCapability::High(GpuBackend::Cuda)
        } else if Self::has_metal() {
            GpuCapability::High(GpuBackend::Metal)
        } else if Self::has_vulkan() {
            GpuCapability::Basic(GpuBackend::Vulkan)
        } else {
            GpuCapability::None
        }
    }

    fn acquire(&self, kind: DeviceKind) -> MlResult<Device> {
        match kind {
            DeviceKind::Cpu => Ok(Device::cpu()),
            DeviceKind::Gpu => self
                .gpu_capability()
                .backend()
                .map(Device::gpu)
                .ok_or_else(|| MlError::Device("no GPU backend detected".into())),
        }
    }
}

/// Never offers a GPU
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuOnlyProbe;

impl DeviceProbe for CpuOnlyProbe {
    fn gpu_capability(&self) -> GpuCapability {
        GpuCapability::None
    }

    fn acquire(&self, kind: DeviceKind) -> MlResult<Device> {
        match kind {
            DeviceKind::Cpu => Ok(Device::cpu()),
            DeviceKind::Gpu => Err(MlError::Device("GPU disabled".into())),
        }
    }
}

/// Pick a device for `tier`.
///
/// Free tier asks for the CPU only. Pro tier asks for a GPU when one is
/// reported and retries once on the CPU if acquisition fails. A free tier
/// that ends on anything but the CPU is a [`MlError::TierViolation`].
pub fn select_device(probe: &dyn DeviceProbe, tier: Tier) -> MlResult<Device> {
    let device = match tier {
        Tier::Free => probe.acquire(DeviceKind::Cpu)?,
        Tier::Pro => {
            let capability = probe.gpu_capability();
            if capability.backend().is_some() {
                match probe.acquire(DeviceKind::Gpu) {
                    Ok(device) => device,
                    Err(e) => {
                        log::warn!("GPU acquisition failed ({e}), retrying on CPU");
                        probe.acquire(DeviceKind::Cpu)?
                    }
                }
            } else {
                probe.acquire(DeviceKind::Cpu)?
            }
        }
    };

    if !tier.allows_gpu() && !device.is_cpu() {
        return Err(MlError::TierViolation(format!(
            "{tier} tier must run on CPU, probe returned {device}"
        )));
    }

    log::info!("Selected device {device} for {tier} tier");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyGpu;

    impl DeviceProbe for FlakyGpu {
        fn gpu_capability(&self) -> GpuCapability {
            GpuCapability::High(GpuBackend::Cuda)
        }

        fn acquire(&self, kind: DeviceKind) -> MlResult<Device> {
            match kind {
                DeviceKind::Cpu => Ok(Device::cpu()),
                DeviceKind::Gpu => Err(MlError::Device("out of memory".into())),
            }
        }
    }

    struct WorkingGpu;

    impl DeviceProbe for WorkingGpu {
        fn gpu_capability(&self) -> GpuCapability {
            GpuCapability::Basic(GpuBackend::Vulkan)
        }

        fn acquire(&self, kind: DeviceKind) -> MlResult<Device> {
            Ok(match kind {
                DeviceKind::Cpu => Device::cpu(),
                DeviceKind::Gpu => Device::gpu(GpuBackend::Vulkan),
            })
        }
    }

    /// Hands out a GPU whatever is asked
    struct AlwaysGpu;

    impl DeviceProbe for AlwaysGpu {
        fn gpu_capability(&self) -> GpuCapability {
            GpuCapability::High(GpuBackend::Metal)
        }

        fn acquire(&self, _kind: DeviceKind) -> MlResult<Device> {
            Ok(Device::gpu(GpuBackend::Metal))
        }
    }

    #[test]
    fn test_free_tier_uses_cpu() {
        let device = select_device(&WorkingGpu, Tier::Free).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_pro_tier_prefers_gpu() {
        let device = select_device(&WorkingGpu, Tier::Pro).unwrap();
        assert_eq!(device.kind, DeviceKind::Gpu);
        assert_eq!(device.backend, Some(GpuBackend::Vulkan));
    }

    #[test]
    fn test_pro_tier_falls_back_to_cpu() {
        let device = select_device(&FlakyGpu, Tier::Pro).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_free_tier_on_gpu_is_violation() {
        assert!(matches!(
            select_device(&AlwaysGpu, Tier::Free),
            Err(MlError::TierViolation(_))
        ));
    }

    #[test]
    fn test_cpu_only_probe() {
        assert_eq!(CpuOnlyProbe.gpu_capability(), GpuCapability::None);
        assert!(CpuOnlyProbe.acquire(DeviceKind::Gpu).is_err());
        assert!(select_device(&CpuOnlyProbe, Tier::Pro).unwrap().is_cpu());
    }
}
