//! Process-wide tunables of the P2P transport.
//!
//! Resolved once when the transport registry is built and handed to every
//! component by reference. Override via environment variables (prefixed
//! `NCCL_`) or by constructing a custom `P2pConfig`.

/// Value of `NCCL_P2P_READ_ENABLE` meaning "let the topology decide".
pub const READ_ENABLE_AUTO: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pConfig {
    /// Route bytes through a proxy-driven copy engine instead of letting the
    /// producing GPU write the remote buffer.
    pub use_memcpy: bool,

    /// Forced transfer direction. `None` defers to the topology's hint.
    pub read_enable: Option<bool>,

    /// Disable the same-process direct-pointer fast path flags.
    pub direct_disable: bool,

    /// Batch consecutive full-size slices into one copy per run. When off,
    /// every slice gets its own copy and completion event.
    pub merge_memcpy: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            use_memcpy: true,
            read_enable: Some(false),
            direct_disable: false,
            merge_memcpy: true,
        }
    }
}

impl P2pConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NCCL_P2P_USE_CUDA_MEMCPY`
    /// - `NCCL_P2P_READ_ENABLE` (`-2` lets the topology choose)
    /// - `NCCL_P2P_DIRECT_DISABLE`
    /// - `NCCL_P2P_MERGE_MEMCPY`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let int = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

        if let Some(v) = int("NCCL_P2P_USE_CUDA_MEMCPY") {
            cfg.use_memcpy = v != 0;
        }
        if let Some(v) = int("NCCL_P2P_READ_ENABLE") {
            cfg.read_enable = if v == READ_ENABLE_AUTO { None } else { Some(v != 0) };
        }
        if let Some(v) = int("NCCL_P2P_DIRECT_DISABLE") {
            cfg.direct_disable = v != 0;
        }
        if let Some(v) = int("NCCL_P2P_MERGE_MEMCPY") {
            cfg.merge_memcpy = v != 0;
        }
        cfg
    }

    /// Direct-write configuration: no copy engine, no forced reads.
    pub fn direct() -> Self {
        Self {
            use_memcpy: false,
            ..Self::default()
        }
    }
}
