//! Radio driver contract, a consumed collaborator.
//!
//! The physical BLE advertising/scanning and short-range peer-to-peer
//! datagram transport are out of scope for this crate. The engine only
//! requires this much: start/stop advertising and scanning, set the
//! current advertisement bytes, send a unicast datagram, and drain
//! whatever ingress arrived since the last poll. Real implementations
//! (esp32-nimble scan callbacks, bluer discovery events) push into an
//! internal queue from their own event loop or task and implement the
//! `poll_*` methods as a non-blocking drain — the engine never blocks
//! on radio I/O: no lock is held across radio I/O.

/// One received advertisement, as delivered to `on_beacon`.
#[derive(Debug, Clone)]
pub struct BeaconIngress {
    pub raw_adv_bytes: Vec<u8>,
    pub rssi_dbm: i8,
    pub src_addr: [u8; 6],
}

/// One received unicast datagram, as delivered to `on_recv`.
#[derive(Debug, Clone)]
pub struct UnicastIngress {
    pub src_addr: [u8; 6],
    pub bytes: Vec<u8>,
}

pub trait RadioDriver: Send + Sync {
    fn advertise_start(&self) -> Result<(), String>;
    fn advertise_stop(&self) -> Result<(), String>;

    /// Set the current advertisement raw bytes (<= 31 bytes).
    /// Takes effect on the next `advertise_start`.
    fn advertise_set(&self, payload: &[u8]) -> Result<(), String>;

    fn scan_start(&self) -> Result<(), String>;
    fn scan_stop(&self) -> Result<(), String>;

    fn send_unicast(&self, addr: [u8; 6], bytes: &[u8]) -> Result<(), String>;

    /// Drain beacons received since the last call. Never blocks.
    fn poll_beacons(&self) -> Vec<BeaconIngress>;

    /// Drain unicast datagrams received since the last call. Never blocks.
    fn poll_unicast(&self) -> Vec<UnicastIngress>;
}
