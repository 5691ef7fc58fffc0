//! Host Linux cluster node: a `wsn_core::Engine` driven over a real
//! BlueZ adapter. Async I/O (discovery, advertising) lives in a small
//! `bluer`/`tokio` shell; the engine itself stays synchronous and
//! hardware-agnostic, reached from a dedicated blocking thread via
//! `tokio::runtime::Handle::block_on`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluer::adv::Advertisement;
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use log::{error, info, warn};

use wsn_core::persistence::FileStore;
use wsn_core::radio::{BeaconIngress, UnicastIngress};
use wsn_core::{Clock, Engine, RadioDriver, SystemClock};

/// Manufacturer-data company identifier, matching `wsn_core::beacon::COMPANY_ID`.
const COMPANY_ID: u16 = 0x02E5;

/// Full on-air beacon frame size (`wsn_core::beacon::BeaconWire`), minus
/// the 2-byte company id that `bluer` strips into the map key.
const BEACON_MFG_PAYLOAD_LEN: usize = 19;

/// Directed-schedule payload: a 2-byte destination MAC tail prepended to
/// the 14-byte `wsn_core::scheduler::ScheduleWire` frame. There is no
/// true link-layer unicast over legacy advertising, so a schedule frame
/// is broadcast like a beacon but tagged with its intended recipient's
/// MAC tail; every node overhears it and only the addressed one keeps it.
const SCHEDULE_MFG_PAYLOAD_LEN: usize = 16;

/// How long a directed-schedule burst pre-empts the regular beacon
/// advertisement before it resumes (mirrors the reference repeater's
/// fixed re-broadcast burst window).
const UNICAST_BURST: Duration = Duration::from_millis(300);

struct RadioInner {
    adapter: bluer::Adapter,
    handle: tokio::runtime::Handle,
    own_mac_tail: [u8; 2],
    current_adv: Mutex<Option<bluer::adv::AdvertisementHandle>>,
    last_beacon_payload: Mutex<Vec<u8>>,
    advertising_enabled: AtomicBool,
    scanning_enabled: AtomicBool,
    beacon_inbox: Mutex<VecDeque<BeaconIngress>>,
    unicast_inbox: Mutex<VecDeque<UnicastIngress>>,
}

#[derive(Clone)]
struct BluerRadio(Arc<RadioInner>);

impl BluerRadio {
    fn new(adapter: bluer::Adapter, handle: tokio::runtime::Handle, own_mac_tail: [u8; 2]) -> Self {
        Self(Arc::new(RadioInner {
            adapter,
            handle,
            own_mac_tail,
            current_adv: Mutex::new(None),
            last_beacon_payload: Mutex::new(Vec::new()),
            advertising_enabled: AtomicBool::new(false),
            scanning_enabled: AtomicBool::new(false),
            beacon_inbox: Mutex::new(VecDeque::new()),
            unicast_inbox: Mutex::new(VecDeque::new()),
        }))
    }

    /// Replace whatever is currently broadcast with `mfg_payload` under
    /// our company id. Blocks the calling (dedicated) thread on the
    /// adapter's own async API.
    fn set_advertisement(&self, mfg_payload: Vec<u8>) -> Result<(), String> {
        let inner = self.0.clone();
        inner.handle.clone().block_on(async move {
            let mut manufacturer_data = BTreeMap::new();
            manufacturer_data.insert(COMPANY_ID, mfg_payload);
            let adv = Advertisement {
                advertisement_type: bluer::adv::Type::Broadcast,
                manufacturer_data,
                min_interval: Some(Duration::from_millis(100)),
                max_interval: Some(Duration::from_millis(150)),
                ..Default::default()
            };
            let mut slot = inner.current_adv.lock().unwrap();
            slot.take(); // drop the previous handle first, BlueZ allows only one active set here
            match inner.adapter.advertise(adv).await {
                Ok(h) => {
                    *slot = Some(h);
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        })
    }

    fn handle_mfg_data(&self, addr: [u8; 6], rssi_dbm: i8, data: &BTreeMap<u16, Vec<u8>>) {
        if !self.0.scanning_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(payload) = data.get(&COMPANY_ID) else {
            return;
        };
        match payload.len() {
            BEACON_MFG_PAYLOAD_LEN => {
                let mut raw = COMPANY_ID.to_le_bytes().to_vec();
                raw.extend_from_slice(payload);
                self.0.beacon_inbox.lock().unwrap().push_back(BeaconIngress {
                    raw_adv_bytes: raw,
                    rssi_dbm,
                    src_addr: addr,
                });
            }
            SCHEDULE_MFG_PAYLOAD_LEN => {
                let (dest_tail, schedule_bytes) = payload.split_at(2);
                if dest_tail == self.0.own_mac_tail {
                    self.0.unicast_inbox.lock().unwrap().push_back(UnicastIngress {
                        src_addr: addr,
                        bytes: schedule_bytes.to_vec(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl RadioDriver for BluerRadio {
    fn advertise_start(&self) -> Result<(), String> {
        self.0.advertising_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn advertise_stop(&self) -> Result<(), String> {
        self.0.advertising_enabled.store(false, Ordering::Relaxed);
        self.0.current_adv.lock().unwrap().take();
        Ok(())
    }

    fn advertise_set(&self, payload: &[u8]) -> Result<(), String> {
        if !self.0.advertising_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        if payload.len() < 2 {
            return Err("beacon payload shorter than the company id prefix".into());
        }
        let mfg_payload = payload[2..].to_vec();
        *self.0.last_beacon_payload.lock().unwrap() = mfg_payload.clone();
        self.set_advertisement(mfg_payload)
    }

    fn scan_start(&self) -> Result<(), String> {
        self.0.scanning_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn scan_stop(&self) -> Result<(), String> {
        self.0.scanning_enabled.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn send_unicast(&self, addr: [u8; 6], bytes: &[u8]) -> Result<(), String> {
        let mut directed = addr[4..6].to_vec();
        directed.extend_from_slice(bytes);
        self.set_advertisement(directed)?;

        let inner = self.0.clone();
        inner.handle.clone().block_on(async move {
            tokio::time::sleep(UNICAST_BURST).await;
        });

        let resume = self.0.last_beacon_payload.lock().unwrap().clone();
        if !resume.is_empty() && self.0.advertising_enabled.load(Ordering::Relaxed) {
            self.set_advertisement(resume)?;
        }
        Ok(())
    }

    fn poll_beacons(&self) -> Vec<BeaconIngress> {
        std::mem::take(&mut *self.0.beacon_inbox.lock().unwrap()).into_iter().collect()
    }

    fn poll_unicast(&self) -> Vec<UnicastIngress> {
        std::mem::take(&mut *self.0.unicast_inbox.lock().unwrap()).into_iter().collect()
    }
}

/// Background discovery loop: watches newly-seen devices and their
/// manufacturer-data property changes, feeding `radio`'s inboxes.
async fn run_discovery(adapter: bluer::Adapter, radio: BluerRadio) -> bluer::Result<()> {
    let mut events = adapter.discover_devices().await?;
    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(addr) = event else {
            continue;
        };
        let adapter = adapter.clone();
        let radio = radio.clone();
        tokio::spawn(async move {
            let Ok(device) = adapter.device(addr) else {
                return;
            };
            if let Ok(Some(data)) = device.manufacturer_data().await {
                let rssi = device.rssi().await.ok().flatten().unwrap_or(0) as i8;
                radio.handle_mfg_data(addr.0, rssi, &data);
            }
            let Ok(mut device_events) = device.events().await else {
                return;
            };
            while let Some(evt) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::ManufacturerData(data)) = evt {
                    let rssi = device.rssi().await.ok().flatten().unwrap_or(0) as i8;
                    radio.handle_mfg_data(addr.0, rssi, &data);
                }
            }
        });
    }
    Ok(())
}

#[tokio::main]
async fn main() -> bluer::Result<()> {
    env_logger::init();

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    let own_addr = adapter.address().await?;

    info!("cluster node starting on adapter {} [{}]", adapter.name(), own_addr);

    let runtime_handle = tokio::runtime::Handle::current();
    let own_mac_tail = [own_addr.0[4], own_addr.0[5]];
    let radio = BluerRadio::new(adapter.clone(), runtime_handle, own_mac_tail);

    tokio::spawn(run_discovery(adapter.clone(), radio.clone()));

    let cluster_key = std::env::var("WSN_CLUSTER_KEY").unwrap_or_else(|_| "change-me-cluster-key".to_string());
    let state_dir = std::env::var("WSN_STATE_DIR").unwrap_or_else(|_| "/var/lib/wsn".to_string());
    let persistence = match FileStore::new(&state_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open state directory {state_dir}: {e}");
            return Ok(());
        }
    };
    let clock = Arc::new(SystemClock::new());

    let engine = match Engine::new(radio, persistence, ArcClock(clock.clone()), own_addr.0, cluster_key.into_bytes()) {
        Ok(e) => e,
        Err(e) => {
            error!("engine init failed: {e}");
            return Ok(());
        }
    };

    tokio::task::spawn_blocking(move || loop {
        engine.tick();
        std::thread::sleep(Duration::from_millis(100));
        if clock.now_ms() % 10_000 < 100 {
            info!("role={:?} visual={:?}", engine.role(), engine.visual());
        }
    })
    .await
    .map_err(|e| {
        warn!("engine task joined with an error: {e}");
        bluer::Error {
            kind: bluer::ErrorKind::Failed,
            message: e.to_string(),
        }
    })?;

    Ok(())
}

/// Cheaply cloneable `Clock` handle so the blocking engine thread and the
/// async shell can share one monotonic source.
#[derive(Clone)]
struct ArcClock(Arc<SystemClock>);

impl Clock for ArcClock {
    fn now_us(&self) -> u64 {
        self.0.now_us()
    }

    fn set_unix_offset_ms(&self, unix_now_ms: i64) {
        self.0.set_unix_offset_ms(unix_now_ms)
    }

    fn unix_time_ms(&self) -> Option<i64> {
        self.0.unix_time_ms()
    }
}
