//! Device capability tables.

/// Hardware limits the schedulers and lowering passes plan against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub sm_major: u32,
    pub sm_minor: u32,
    /// Default static shared memory per block.
    pub max_shared_bytes: u64,
    /// Opt-in dynamic shared memory ceiling per block.
    pub max_shared_bytes_optin: u64,
    pub max_regs_per_thread: u32,
    pub warp_size: u32,
    /// Grid limits per dimension (x, y, z).
    pub max_grid: [u64; 3],
    pub l2_bytes: u64,
}

/// Hardware y/z-grid ceiling shared by every supported architecture.
pub const Y_GRID_LIMIT: u64 = 65_535;

impl DeviceCapability {
    /// Turing (RTX 20xx, T4).
    pub fn sm75() -> Self {
        Self {
            sm_major: 7,
            sm_minor: 5,
            max_shared_bytes: 48 * 1024,
            max_shared_bytes_optin: 64 * 1024,
            max_regs_per_thread: 255,
            warp_size: 32,
            max_grid: [2_147_483_647, Y_GRID_LIMIT, Y_GRID_LIMIT],
            l2_bytes: 4 * 1024 * 1024,
        }
    }

    /// Ampere (A100).
    pub fn sm80() -> Self {
        Self {
            sm_major: 8,
            sm_minor: 0,
            max_shared_bytes: 48 * 1024,
            max_shared_bytes_optin: 163 * 1024,
            max_regs_per_thread: 255,
            warp_size: 32,
            max_grid: [2_147_483_647, Y_GRID_LIMIT, Y_GRID_LIMIT],
            l2_bytes: 40 * 1024 * 1024,
        }
    }

    /// Hopper (H100).
    pub fn sm90() -> Self {
        Self {
            sm_major: 9,
            sm_minor: 0,
            max_shared_bytes: 48 * 1024,
            max_shared_bytes_optin: 227 * 1024,
            max_regs_per_thread: 255,
            warp_size: 32,
            max_grid: [2_147_483_647, Y_GRID_LIMIT, Y_GRID_LIMIT],
            l2_bytes: 50 * 1024 * 1024,
        }
    }

    pub fn supports_cp_async(&self) -> bool {
        self.sm_major >= 8
    }

    pub fn supports_cp_async_bulk(&self) -> bool {
        self.sm_major >= 9
    }

    pub fn supports_bf16(&self) -> bool {
        self.sm_major >= 8
    }
}

impl Default for DeviceCapability {
    fn default() -> Self {
        Self::sm80()
    }
}
