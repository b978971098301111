use std::sync::OnceLock;

/// Inner-loop shape of the CPU E-step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KernelPath {
    /// One data point at a time.
    Scalar,
    /// Blocks of [`LANES`] data points sharing one pass over the model, laid
    /// out for the compiler to vectorize.
    Lanes,
}

/// Width of a [`KernelPath::Lanes`] block.
pub const LANES: usize = 8;

/// Immutable description of the host, detected once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub threads: usize,
    pub wide_lanes: bool,
}

impl Capabilities {
    pub fn get() -> &'static Capabilities {
        static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();
        CAPABILITIES.get_or_init(|| {
            let caps = Capabilities {
                threads: rayon::current_num_threads(),
                wide_lanes: detect_wide_lanes(),
            };
            log::debug!("detected {caps:?}");
            caps
        })
    }

    #[inline]
    pub fn kernel_path(&self) -> KernelPath {
        if self.wide_lanes {
            KernelPath::Lanes
        } else {
            KernelPath::Scalar
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_wide_lanes() -> bool {
    std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma")
}

#[cfg(target_arch = "aarch64")]
fn detect_wide_lanes() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_wide_lanes() -> bool {
    false
}
