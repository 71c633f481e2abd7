//! Live packet capture: interface selection, BPF-filtered sniffing, TCP
//! payload extraction.

pub mod interface;
pub mod sniffer;

use std::fmt;

pub use interface::{list_devices, select_device};
pub use sniffer::{CaptureSnapshot, PacketSniffer};

/// Capture failures (closed set)
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// No capture devices visible (permissions, or no libpcap)
    NoDevices,
    /// A configured interface name does not exist
    DeviceNotFound(String),
    /// Opening the device failed
    Open(String),
    /// Installing the BPF filter failed; fatal to startup
    Filter(String),
    /// Native error while the capture loop was running
    Fatal(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevices => write!(f, "no capture devices found"),
            Self::DeviceNotFound(name) => write!(f, "capture interface not found: {}", name),
            Self::Open(e) => write!(f, "failed to open capture device: {}", e),
            Self::Filter(e) => write!(f, "failed to install bpf filter: {}", e),
            Self::Fatal(e) => write!(f, "capture failed: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}
