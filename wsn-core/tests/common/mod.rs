//! Shared test doubles for the scripted end-to-end scenarios: an
//! in-memory radio medium and a manually-advanced clock, both cheaply
//! cloneable handles onto shared state so the test driver can inject
//! beacons/schedules and advance simulated time independently of
//! whatever `Engine` owns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wsn_core::{BeaconIngress, Clock, RadioDriver, UnicastIngress};

#[derive(Clone)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.0.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn set_unix_offset_ms(&self, _unix_now_ms: i64) {}

    fn unix_time_ms(&self) -> Option<i64> {
        None
    }
}

struct RadioInner {
    last_adv_payload: Mutex<Vec<u8>>,
    beacon_inbox: Mutex<VecDeque<BeaconIngress>>,
    unicast_inbox: Mutex<VecDeque<UnicastIngress>>,
    sent_unicast: Mutex<Vec<([u8; 6], Vec<u8>)>>,
}

#[derive(Clone)]
pub struct TestRadio(Arc<RadioInner>);

impl TestRadio {
    pub fn new() -> Self {
        Self(Arc::new(RadioInner {
            last_adv_payload: Mutex::new(Vec::new()),
            beacon_inbox: Mutex::new(VecDeque::new()),
            unicast_inbox: Mutex::new(VecDeque::new()),
            sent_unicast: Mutex::new(Vec::new()),
        }))
    }

    /// The bytes currently set via `advertise_set`, i.e. whatever this
    /// node is broadcasting right now.
    pub fn current_adv_payload(&self) -> Vec<u8> {
        self.0.last_adv_payload.lock().unwrap().clone()
    }

    /// Inject a received beacon, as if the radio layer had just heard it
    /// over the air.
    pub fn push_beacon(&self, raw_adv_bytes: Vec<u8>, rssi_dbm: i8, src_addr: [u8; 6]) {
        self.0.beacon_inbox.lock().unwrap().push_back(BeaconIngress {
            raw_adv_bytes,
            rssi_dbm,
            src_addr,
        });
    }

    /// Inject a received unicast datagram (e.g. a schedule frame).
    pub fn push_unicast(&self, bytes: Vec<u8>, src_addr: [u8; 6]) {
        self.0.unicast_inbox.lock().unwrap().push_back(UnicastIngress { src_addr, bytes });
    }

    /// Drain whatever this node has sent via `send_unicast` since the
    /// last call.
    pub fn drain_sent_unicast(&self) -> Vec<([u8; 6], Vec<u8>)> {
        std::mem::take(&mut self.0.sent_unicast.lock().unwrap())
    }
}

impl RadioDriver for TestRadio {
    fn advertise_start(&self) -> Result<(), String> {
        Ok(())
    }

    fn advertise_stop(&self) -> Result<(), String> {
        Ok(())
    }

    fn advertise_set(&self, payload: &[u8]) -> Result<(), String> {
        *self.0.last_adv_payload.lock().unwrap() = payload.to_vec();
        Ok(())
    }

    fn scan_start(&self) -> Result<(), String> {
        Ok(())
    }

    fn scan_stop(&self) -> Result<(), String> {
        Ok(())
    }

    fn send_unicast(&self, addr: [u8; 6], bytes: &[u8]) -> Result<(), String> {
        self.0.sent_unicast.lock().unwrap().push((addr, bytes.to_vec()));
        Ok(())
    }

    fn poll_beacons(&self) -> Vec<BeaconIngress> {
        std::mem::take(&mut *self.0.beacon_inbox.lock().unwrap()).into_iter().collect()
    }

    fn poll_unicast(&self) -> Vec<UnicastIngress> {
        std::mem::take(&mut *self.0.unicast_inbox.lock().unwrap()).into_iter().collect()
    }
}

pub const CLUSTER_KEY: &[u8] = b"integration-test-cluster-key";

pub fn node_addr(last_byte: u8) -> [u8; 6] {
    [0, 0, 0, 0, 0, last_byte]
}

/// Step everyone's clock by `delta_us`, tick every engine, then relay
/// each node's current advertisement to every other node's radio at a
/// fixed `rssi_dbm` — a fully-connected single-hop cluster.
pub fn exchange_round(radios: &[&TestRadio], addrs: &[[u8; 6]], rssi_dbm: i8) {
    let payloads: Vec<Vec<u8>> = radios.iter().map(|r| r.current_adv_payload()).collect();
    for (i, payload) in payloads.iter().enumerate() {
        if payload.is_empty() {
            continue;
        }
        for (j, radio) in radios.iter().enumerate() {
            if i == j {
                continue;
            }
            radio.push_beacon(payload.clone(), rssi_dbm, addrs[i]);
        }
    }
}
