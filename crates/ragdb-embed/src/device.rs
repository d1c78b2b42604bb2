use anyhow::{bail, Result};
use candle_core::Device;

use ragdb_core::config::EmbedDevice;

/// Resolve the configured device. An explicit `metal` that cannot be opened is
/// an error; `auto` falls back to the CPU.
pub fn select_device(preference: EmbedDevice) -> Result<Device> {
    match preference {
        EmbedDevice::Cpu => Ok(Device::Cpu),
        EmbedDevice::Metal => match metal() {
            Some(Ok(dev)) => Ok(dev),
            Some(Err(e)) => bail!("embedder.device = \"metal\" but no Metal device could be opened: {e}"),
            None => bail!("embedder.device = \"metal\" requires building ragdb-embed with the `metal` feature"),
        },
        EmbedDevice::Auto => match metal() {
            Some(Ok(dev)) => Ok(dev),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Metal unavailable, using CPU");
                Ok(Device::Cpu)
            }
            None => Ok(Device::Cpu),
        },
    }
}

#[cfg(feature = "metal")]
fn metal() -> Option<candle_core::Result<Device>> { Some(Device::new_metal(0)) }

#[cfg(not(feature = "metal"))]
fn metal() -> Option<candle_core::Result<Device>> { None }
