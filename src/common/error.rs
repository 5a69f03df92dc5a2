use std::io;

pub type Result<T> = std::result::Result<T, P2pError>;

/// NCCL result codes handed back to the caller through `P2pError::code`.
pub const NCCL_UNHANDLED_CUDA_ERROR: i32 = 1;
pub const NCCL_SYSTEM_ERROR: i32 = 2;
pub const NCCL_INTERNAL_ERROR: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    /// Logic or size-mismatch fault. Never retried.
    #[error("p2p protocol fault: {reason}")]
    Protocol { reason: String },

    /// A device runtime call failed.
    #[error("{call} failed with code {code}{}", device_suffix(.device, .bus_id))]
    Native {
        call: &'static str,
        code: i32,
        /// Unknown until the caller attaches it with `on_device`.
        device: Option<i32>,
        bus_id: Option<i64>,
    },

    #[error("system error: {0}")]
    System(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

fn device_suffix(device: &Option<i32>, bus_id: &Option<i64>) -> String {
    match (device, bus_id) {
        (Some(dev), Some(bus)) => format!(" on dev {}(={:x})", dev, bus),
        (Some(dev), None) => format!(" on dev {}", dev),
        _ => String::new(),
    }
}

impl P2pError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        P2pError::Protocol {
            reason: reason.into(),
        }
    }

    pub fn native(call: &'static str, code: i32) -> Self {
        P2pError::Native {
            call,
            code,
            device: None,
            bus_id: None,
        }
    }

    /// Attach the device identity to a native fault for diagnosis.
    pub fn on_device(self, dev: i32, bus: i64) -> Self {
        match self {
            P2pError::Native { call, code, .. } => P2pError::Native {
                call,
                code,
                device: Some(dev),
                bus_id: Some(bus),
            },
            other => other,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            P2pError::Protocol { .. } => NCCL_INTERNAL_ERROR,
            P2pError::Native { .. } => NCCL_UNHANDLED_CUDA_ERROR,
            P2pError::System(_) => NCCL_SYSTEM_ERROR,
            P2pError::Codec(_) => NCCL_INTERNAL_ERROR,
        }
    }
}
