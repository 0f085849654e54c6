use candle_core::Device;

/// Check if CUDA is available
pub fn has_cuda() -> bool {
    candle_core::utils::cuda_is_available()
}

/// Check if Metal is available
pub fn has_metal() -> bool {
    candle_core::utils::metal_is_available()
}

/// A parsed device name. Unlike [`Device`], this is comparable and cheap to send
/// to worker threads before the device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn open(self) -> anyhow::Result<Device> {
        Ok(match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal)?,
        })
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(n) => write!(f, "cuda:{n}"),
            DeviceSpec::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

fn parse_ordinal(device_str: &str, prefix: &str) -> anyhow::Result<usize> {
    device_str
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow::anyhow!("Invalid {prefix} device format"))?
        .parse::<usize>()
        .map_err(|_| anyhow::anyhow!("Invalid device ID in {device_str}"))
}

/// Parse device string into a [`DeviceSpec`]
///
/// Supported formats:
/// - "cpu" -> DeviceSpec::Cpu
/// - "cuda" -> DeviceSpec::Cuda(0)
/// - "cuda:N" -> DeviceSpec::Cuda(N)
/// - "metal" / "metal:N" -> DeviceSpec::Metal(N)
pub fn parse_device(device_str: &str) -> anyhow::Result<DeviceSpec> {
    match device_str.trim().to_lowercase().as_str() {
        "cpu" => Ok(DeviceSpec::Cpu),
        "cuda" => Ok(DeviceSpec::Cuda(0)),
        "metal" | "mps" => Ok(DeviceSpec::Metal(0)),
        s if s.starts_with("cuda:") => Ok(DeviceSpec::Cuda(parse_ordinal(s, "cuda:")?)),
        s if s.starts_with("metal:") => Ok(DeviceSpec::Metal(parse_ordinal(s, "metal:")?)),
        _ => anyhow::bail!(
            "Invalid device: {}. Supported: cpu, cuda, cuda:N, metal, metal:N",
            device_str
        ),
    }
}

/// Parses one device per worker.
pub fn parse_devices<S: AsRef<str>>(devices: &[S]) -> anyhow::Result<Vec<DeviceSpec>> {
    devices.iter().map(|d| parse_device(d.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("cpu").unwrap(), DeviceSpec::Cpu);
        assert_eq!(parse_device("CUDA:42").unwrap(), DeviceSpec::Cuda(42));
        assert_eq!(parse_device("cuda").unwrap(), DeviceSpec::Cuda(0));
        assert_eq!(parse_device("metal:1").unwrap(), DeviceSpec::Metal(1));
        assert!(parse_device("nvidia").is_err());
        assert!(parse_device("").is_err());
        assert!(parse_device("cuda:").is_err());
        assert!(parse_device("cuda:abc").is_err());
        assert!(parse_device("cuda:-1").is_err());
        assert!(parse_device("cuda:1.5").is_err());
    }

    #[test]
    fn test_parse_devices_keeps_order() {
        let devices = parse_devices(&["cpu", "cuda:1", "cpu"]).unwrap();
        assert_eq!(
            devices,
            vec![DeviceSpec::Cpu, DeviceSpec::Cuda(1), DeviceSpec::Cpu]
        );
        assert_eq!(devices[1].to_string(), "cuda:1");
    }

    #[test]
    fn test_cpu_opens() {
        let device = DeviceSpec::Cpu.open().unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_cuda_unavailable_is_an_error() {
        if !has_cuda() {
            assert!(DeviceSpec::Cuda(0).open().is_err());
        }
    }
}
