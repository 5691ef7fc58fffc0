//! ESP32 firmware entry point: a `wsn_core::Engine` driven from FreeRTOS
//! tasks over `esp32-nimble` advertising/scanning and ESP-IDF NVS
//! persistence. Mirrors the reference repeater's scan/advertise idiom
//! (`block_on` over nimble's async scan API, `FreeRtos::delay_ms` for
//! pacing) but hands all protocol decisions to `wsn_core`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use esp32_nimble::enums::*;
use esp32_nimble::{BLEAdvertisementData, BLEDevice, BLEScan};
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::task::block_on;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{esp_mac_type_t_ESP_MAC_BT, esp_read_mac, esp_timer_get_time};
use log::{error, info};

use wsn_core::radio::{BeaconIngress, UnicastIngress};
use wsn_core::{Clock, Engine, PersistenceStore, RadioDriver};

/// Manufacturer-data company identifier, matching `wsn_core::beacon::COMPANY_ID`.
const COMPANY_ID: u16 = 0x02E5;

/// Full beacon wire size (`wsn_core::beacon::BeaconWire`).
const BEACON_WIRE_LEN: usize = 21;

/// Directed-schedule payload: 2-byte destination MAC tail + the 14-byte
/// `wsn_core::scheduler::ScheduleWire` frame (see the matching note in
/// the Linux binary — there is no link-layer unicast over legacy
/// advertising, so schedule frames ride the same broadcast channel
/// tagged with their recipient's MAC tail).
const SCHEDULE_DIRECTED_LEN: usize = 16;

/// How long each scan window stays open per cycle.
const SCAN_DURATION_MS: i32 = 1_000;

/// How long a directed-schedule burst occupies the advertiser before the
/// regular beacon resumes.
const UNICAST_BURST_MS: u32 = 150;

fn now_us() -> i64 {
    unsafe { esp_timer_get_time() }
}

/// Monotonic clock backed by `esp_timer_get_time`, with a settable
/// Unix-epoch offset: no RTC is assumed present, so `unix_time_ms` stays
/// `None` until something (e.g. a GATT time-set characteristic, out of
/// scope here) calls `set_unix_offset_ms`.
struct EspClock {
    offset_ms: AtomicI64,
    offset_is_set: AtomicBool,
}

impl EspClock {
    fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            offset_is_set: AtomicBool::new(false),
        }
    }
}

impl Clock for EspClock {
    fn now_us(&self) -> u64 {
        now_us() as u64
    }

    fn set_unix_offset_ms(&self, unix_now_ms: i64) {
        self.offset_ms.store(unix_now_ms - self.now_ms() as i64, Ordering::SeqCst);
        self.offset_is_set.store(true, Ordering::SeqCst);
    }

    fn unix_time_ms(&self) -> Option<i64> {
        if !self.offset_is_set.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.offset_ms.load(Ordering::SeqCst) + self.now_ms() as i64)
    }
}

/// Flash-backed key/value store over ESP-IDF's NVS, used for uptime and
/// the administrative `CONFIG` surface.
struct NvsStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Result<Self, esp_idf_svc::sys::EspError> {
        let nvs = EspNvs::new(partition, "wsn", true)?;
        Ok(Self { nvs: Mutex::new(nvs) })
    }
}

impl PersistenceStore for NvsStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let nvs = self.nvs.lock().unwrap();
        let mut buf = [0u8; 64];
        match nvs.get_raw(key, &mut buf) {
            Ok(Some(slice)) => Some(slice.to_vec()),
            _ => None,
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), String> {
        self.nvs.lock().unwrap().set_raw(key, value).map_err(|e| e.to_string())
    }
}

struct Inboxes {
    beacon: Mutex<VecDeque<BeaconIngress>>,
    unicast: Mutex<VecDeque<UnicastIngress>>,
}

/// `RadioDriver` over a single `esp32-nimble` advertising handle plus a
/// background scan task. Advertising and unicast share one BLE5 legacy
/// advertising set, time-multiplexed: a directed schedule burst
/// pre-empts the beacon for [`UNICAST_BURST_MS`] before it resumes,
/// exactly as the reference repeater re-broadcasts each active
/// notification for a fixed window before moving to the next.
struct NimbleRadio {
    advertising: &'static esp32_nimble::utilities::mutex::Mutex<esp32_nimble::BLEAdvertising<'static>>,
    own_mac_tail: [u8; 2],
    advertising_enabled: AtomicBool,
    last_beacon_payload: Mutex<Vec<u8>>,
    scanning_enabled: Arc<AtomicBool>,
    inboxes: Arc<Inboxes>,
}

impl NimbleRadio {
    fn start_advertisement(&self, mfg_payload: &[u8]) -> Result<(), String> {
        let mut adv = self.advertising.lock();
        let _ = adv.stop();
        adv.advertisement_type(ConnMode::Non);
        adv.scan_response(false);
        const INTERVAL: u16 = 32; // 32 x 0.625ms = 20ms
        adv.min_interval(INTERVAL);
        adv.max_interval(INTERVAL);

        let mut data = BLEAdvertisementData::new();
        data.manufacturer_data(mfg_payload);
        adv.set_data(&mut data).map_err(|e| format!("{e:?}"))?;
        adv.start().map_err(|e| format!("{e:?}"))
    }
}

impl RadioDriver for NimbleRadio {
    fn advertise_start(&self) -> Result<(), String> {
        self.advertising_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn advertise_stop(&self) -> Result<(), String> {
        self.advertising_enabled.store(false, Ordering::Relaxed);
        let mut adv = self.advertising.lock();
        let _ = adv.stop();
        Ok(())
    }

    fn advertise_set(&self, payload: &[u8]) -> Result<(), String> {
        if !self.advertising_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        if payload.len() < 2 {
            return Err("beacon payload shorter than the company id prefix".into());
        }
        // esp32-nimble's manufacturer_data() takes the company id + payload together.
        *self.last_beacon_payload.lock().unwrap() = payload.to_vec();
        self.start_advertisement(payload)
    }

    fn scan_start(&self) -> Result<(), String> {
        self.scanning_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn scan_stop(&self) -> Result<(), String> {
        self.scanning_enabled.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn send_unicast(&self, addr: [u8; 6], bytes: &[u8]) -> Result<(), String> {
        let mut directed = Vec::with_capacity(2 + 2 + bytes.len());
        directed.extend_from_slice(&COMPANY_ID.to_le_bytes());
        directed.extend_from_slice(&addr[4..6]);
        directed.extend_from_slice(bytes);
        self.start_advertisement(&directed)?;
        FreeRtos::delay_ms(UNICAST_BURST_MS);

        let resume = self.last_beacon_payload.lock().unwrap().clone();
        if !resume.is_empty() && self.advertising_enabled.load(Ordering::Relaxed) {
            self.start_advertisement(&resume)?;
        }
        Ok(())
    }

    fn poll_beacons(&self) -> Vec<BeaconIngress> {
        std::mem::take(&mut *self.inboxes.beacon.lock().unwrap()).into_iter().collect()
    }

    fn poll_unicast(&self) -> Vec<UnicastIngress> {
        std::mem::take(&mut *self.inboxes.unicast.lock().unwrap()).into_iter().collect()
    }
}

/// Background FreeRTOS task: repeatedly scans for `SCAN_DURATION_MS`,
/// classifying every manufacturer-data hit under our company id as
/// either a beacon or a directed schedule frame addressed to us.
fn run_scan_loop(ble_device: &'static mut BLEDevice, own_mac_tail: [u8; 2], scanning_enabled: Arc<AtomicBool>, inboxes: Arc<Inboxes>) {
    loop {
        if !scanning_enabled.load(Ordering::Relaxed) {
            FreeRtos::delay_ms(100);
            continue;
        }

        let hits: Vec<([u8; 6], i8, Vec<u8>)> = block_on(async {
            let mut scanner = BLEScan::new();
            scanner.active_scan(true).interval(100).window(99);
            let mut found = Vec::new();
            let _ = scanner
                .start(ble_device, SCAN_DURATION_MS, |device, data| {
                    if let Some(mfg) = data.manufacture_data() {
                        if mfg.company_identifier == COMPANY_ID {
                            found.push((device.addr().val(), device.rssi() as i8, mfg.payload.to_vec()));
                        }
                    }
                    None::<()>
                })
                .await;
            found
        });

        for (addr, rssi, payload) in hits {
            match payload.len() {
                BEACON_WIRE_LEN => {
                    inboxes.beacon.lock().unwrap().push_back(BeaconIngress {
                        raw_adv_bytes: payload,
                        rssi_dbm: rssi,
                        src_addr: addr,
                    });
                }
                SCHEDULE_DIRECTED_LEN => {
                    let (dest_tail, schedule_bytes) = payload.split_at(2);
                    if dest_tail == own_mac_tail {
                        inboxes.unicast.lock().unwrap().push_back(UnicastIngress {
                            src_addr: addr,
                            bytes: schedule_bytes.to_vec(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

fn own_bt_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    unsafe {
        esp_read_mac(mac.as_mut_ptr(), esp_mac_type_t_ESP_MAC_BT);
    }
    mac
}

fn main() {
    // It is necessary to call this function once. Otherwise, some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("cluster node starting");

    let addr = own_bt_mac();
    let cluster_key = option_env!("WSN_CLUSTER_KEY").unwrap_or("change-me-cluster-key").as_bytes().to_vec();

    let nvs_partition = match EspDefaultNvsPartition::take() {
        Ok(p) => p,
        Err(e) => {
            error!("NVS partition unavailable: {e}");
            return;
        }
    };
    let persistence = match NvsStore::new(nvs_partition) {
        Ok(s) => s,
        Err(e) => {
            error!("NVS init failed: {e}");
            return;
        }
    };

    let ble_device = BLEDevice::take();
    let advertising = ble_device.get_advertising();

    let scanning_enabled = Arc::new(AtomicBool::new(false));
    let inboxes = Arc::new(Inboxes {
        beacon: Mutex::new(VecDeque::new()),
        unicast: Mutex::new(VecDeque::new()),
    });
    let own_mac_tail = [addr[4], addr[5]];

    std::thread::Builder::new()
        .stack_size(8 * 1024)
        .spawn({
            let scanning_enabled = scanning_enabled.clone();
            let inboxes = inboxes.clone();
            move || run_scan_loop(ble_device, own_mac_tail, scanning_enabled, inboxes)
        })
        .expect("spawn scan task");

    let radio = NimbleRadio {
        advertising,
        own_mac_tail,
        advertising_enabled: AtomicBool::new(false),
        last_beacon_payload: Mutex::new(Vec::new()),
        scanning_enabled,
        inboxes,
    };

    let engine = match Engine::new(radio, persistence, EspClock::new(), addr, cluster_key) {
        Ok(e) => e,
        Err(e) => {
            error!("engine init failed: {e}");
            return;
        }
    };

    info!("node_id=0x{:08x}, entering tick loop", engine.node_id());

    let mut last_log_ms: u64 = 0;
    loop {
        engine.tick();
        let now_ms = (now_us() / 1_000) as u64;
        if now_ms.saturating_sub(last_log_ms) >= 10_000 {
            info!("role={:?} visual={:?}", engine.role(), engine.visual());
            last_log_ms = now_ms;
        }
        FreeRtos::delay_ms(100);
    }
}
