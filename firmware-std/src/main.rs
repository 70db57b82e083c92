//! GhostNet — ESP-IDF std firmware
//!
//! Thread-based implementation using FreeRTOS threads and std::sync::mpsc
//! channels. Feature-equivalent to the `no_std` Embassy firmware but built
//! on ESP-IDF services (WiFi via esp-idf-svc, RNG via `esp_random`).

#[cfg(feature = "m5stickc")]
mod display;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use ghostnet::{board, comm, config, protocol, radio, scheduler, sniffer};

use comm::LineReader;
use config::GhostNetConfig;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::sys::{
    esp, esp_get_free_heap_size, esp_random, esp_wifi_80211_tx, esp_wifi_set_channel,
    esp_wifi_set_max_tx_power, esp_wifi_set_promiscuous, esp_wifi_set_promiscuous_rx_cb,
    wifi_promiscuous_pkt_t, wifi_promiscuous_pkt_type_t, wifi_second_chan_t_WIFI_SECOND_CHAN_NONE,
};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use protocol::{DeviceMessage, HostCommand, MAX_MSG_LEN};
use radio::{Clock, RadioDriver};
use scheduler::Scheduler;
use sniffer::LearnedSsid;
#[cfg(feature = "mesh")]
use sniffer::{FilterMode, MeshFrame};

// ── Shared state ──────────────────────────────────────────────────────

pub(crate) static RUNNING: AtomicBool = AtomicBool::new(true);
pub(crate) static ACTIVE_COUNT: AtomicU32 = AtomicU32::new(0);
pub(crate) static DORMANT_COUNT: AtomicU32 = AtomicU32::new(0);
pub(crate) static PACKETS_SENT: AtomicU32 = AtomicU32::new(0);
pub(crate) static MESH_DETECTED: AtomicBool = AtomicBool::new(false);
static GHOSTNET_CONFIG: Mutex<GhostNetConfig> = Mutex::new(GhostNetConfig::new());
pub(crate) static LAST_SSID: Mutex<heapless::String<33>> = Mutex::new(heapless::String::new());

static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

pub(crate) fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

static SSID_TX: Mutex<Option<SyncSender<LearnedSsid>>> = Mutex::new(None);

#[cfg(feature = "mesh")]
static MESH_TX: Mutex<Option<SyncSender<MeshFrame>>> = Mutex::new(None);

/// Holds the mesh-frame receiver between construction in `main` and the
/// single `take()` in `generator_loop` — mirrors `SSID_TX`'s static-channel
/// pattern since `generator_loop`'s signature stays feature-independent.
#[cfg(feature = "mesh")]
static MESH_RX_SLOT: Mutex<Option<mpsc::Receiver<MeshFrame>>> = Mutex::new(None);

/// Mirrors `Scheduler::mesh_tick`'s return value so the promiscuous
/// callback knows which filter is currently installed (feature `mesh`,
/// spec.md §4.5/§4.8).
#[cfg(feature = "mesh")]
static MESH_LISTEN_ACTIVE: AtomicBool = AtomicBool::new(false);

/// WiFi promiscuous mode callback. Runs in the WiFi driver task context;
/// must be non-blocking, same constraint as AirHound's `promisc_rx_cb`.
unsafe extern "C" fn promisc_rx_cb(
    buf: *mut std::ffi::c_void,
    _pkt_type: wifi_promiscuous_pkt_type_t,
) {
    let pkt = unsafe { &*(buf as *const wifi_promiscuous_pkt_t) };
    let sig_len = pkt.rx_ctrl.sig_len() as usize;
    if sig_len == 0 {
        return;
    }
    let payload = unsafe { std::slice::from_raw_parts(pkt.payload.as_ptr(), sig_len) };

    if let Some(ssid) = sniffer::filter_probe_learning(payload) {
        if let Ok(guard) = SSID_TX.lock() {
            if let Some(ref tx) = *guard {
                let _ = tx.try_send(ssid);
            }
        }
    }

    #[cfg(feature = "mesh")]
    if MESH_LISTEN_ACTIVE.load(Ordering::Relaxed) {
        if let Some(frame) = sniffer::filter_mesh(payload) {
            if let Ok(guard) = MESH_TX.lock() {
                if let Some(ref tx) = *guard {
                    let _ = tx.try_send(frame);
                }
            }
        }
    }
}

struct EspStdRadio;

impl RadioDriver for EspStdRadio {
    fn set_channel(&mut self, primary: u8, secondary: Option<u8>) {
        let second = secondary.map(|_| 1).unwrap_or(wifi_second_chan_t_WIFI_SECOND_CHAN_NONE);
        unsafe {
            esp_wifi_set_channel(primary, second);
        }
    }

    fn set_max_tx_power(&mut self, quarter_dbm: i8) {
        unsafe {
            esp_wifi_set_max_tx_power(quarter_dbm as i32);
        }
    }

    fn tx_80211(&mut self, frame: &[u8]) {
        unsafe {
            esp_wifi_80211_tx(0, frame.as_ptr() as *const std::ffi::c_void, frame.len() as i32, false);
        }
    }
}

struct StdClock;

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        BOOT_INSTANT
            .lock()
            .ok()
            .and_then(|i| i.map(|boot| boot.elapsed().as_millis() as u64))
            .unwrap_or(0)
    }
}

struct EspRandom;

impl rand_core::RngCore for EspRandom {
    fn next_u32(&mut self) -> u32 {
        unsafe { esp_random() }
    }
    fn next_u64(&mut self) -> u64 {
        let hi = unsafe { esp_random() } as u64;
        let lo = unsafe { esp_random() } as u64;
        (hi << 32) | lo
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let r = unsafe { esp_random() }.to_le_bytes();
            chunk.copy_from_slice(&r[..chunk.len()]);
        }
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::log::EspLogger::initialize_default();
    *BOOT_INSTANT.lock().unwrap() = Some(Instant::now());

    log::info!("GhostNet v{} starting on {} (std)", protocol::VERSION, board::BOARD_NAME);

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    #[cfg(feature = "m5stickc")]
    let _power_hold = {
        use esp_idf_svc::hal::gpio::PinDriver;
        let mut p = PinDriver::output(peripherals.pins.gpio4)?;
        p.set_high()?;
        p
    };

    let (ssid_tx, ssid_rx) = mpsc::sync_channel::<LearnedSsid>(20);
    // Serial/USB-CDC RX would produce into this channel via `feed_console_byte`;
    // no producer is wired up yet, so `command_thread` only ever sees what a
    // future serial task sends.
    let (_cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
    *SSID_TX.lock().unwrap() = Some(ssid_tx);

    #[cfg(feature = "mesh")]
    {
        let (mesh_tx, mesh_rx) = mpsc::sync_channel::<MeshFrame>(5);
        *MESH_TX.lock().unwrap() = Some(mesh_tx);
        *MESH_RX_SLOT.lock().unwrap() = Some(mesh_rx);
    }

    #[cfg(feature = "m5stickc")]
    {
        let spi2 = peripherals.spi2;
        let mosi = peripherals.pins.gpio15;
        let clk = peripherals.pins.gpio13;
        let cs_pin = peripherals.pins.gpio5;
        let dc_pin = peripherals.pins.gpio14;
        let rst_pin = peripherals.pins.gpio12;
        let bl_pin = peripherals.pins.gpio27;
        thread::Builder::new()
            .name("display".into())
            .stack_size(4096)
            .spawn(move || {
                display::display_thread(spi2, mosi, clk, cs_pin, dc_pin, rst_pin, bl_pin);
            })?;
        log::info!("Display thread spawned");
    }

    thread::Builder::new()
        .name("command".into())
        .stack_size(4096)
        .spawn(move || {
            command_thread(cmd_rx);
        })?;
    log::info!("Command thread spawned");

    thread::Builder::new()
        .name("status".into())
        .stack_size(4096)
        .spawn(status_thread)?;
    log::info!("Status thread spawned");

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    wifi.set_configuration(&esp_idf_svc::wifi::Configuration::Client(Default::default()))?;
    wifi.start()?;

    unsafe {
        esp!(esp_wifi_set_promiscuous(true))?;
        esp!(esp_wifi_set_promiscuous_rx_cb(Some(promisc_rx_cb)))?;
    }
    log::info!("WiFi sniffer initialized in promiscuous mode");

    log::info!(
        "Build target: {}",
        if cfg!(feature = "xiao") {
            "xiao (ESP32-S3)"
        } else if cfg!(feature = "m5stickc") {
            "m5stickc (ESP32)"
        } else {
            "unknown"
        }
    );

    generator_loop(ssid_rx);
}

/// Main emission loop: runs on the main thread, pulling learned SSIDs and
/// driving the scheduler's hop tick, spec.md §4.6/§5. Host commands are
/// handled independently by `command_thread`.
fn generator_loop(ssid_rx: mpsc::Receiver<LearnedSsid>) -> ! {
    #[cfg(feature = "mesh")]
    let mesh_rx = MESH_RX_SLOT.lock().unwrap().take().unwrap();
    let mut rng = EspRandom;
    let mut seed_mac = [0u8; 6];
    rand_core::RngCore::fill_bytes(&mut rng, &mut seed_mac);
    seed_mac[0] = 0x02;

    let config = *GHOSTNET_CONFIG.lock().unwrap();
    let mut sched = Scheduler::new(config, seed_mac);
    sched.initialize(&mut rng, || unsafe { esp_get_free_heap_size() } > 30_000);

    log::info!(
        "Pools initialized: {} active, {} dormant",
        sched.pools.active.len(),
        sched.pools.dormant.len()
    );

    let mut radio = EspStdRadio;
    let clock = StdClock;

    loop {
        if !RUNNING.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
            continue;
        }

        let now_ms = clock.now_ms();

        let learned: Vec<LearnedSsid> = ssid_rx.try_iter().collect();
        sched.drain_learned_ssids(learned.into_iter(), now_ms, &mut rng);

        sched.governor_tick(unsafe { esp_get_free_heap_size() });
        sched.lifecycle_tick_if_due(now_ms, &mut rng);

        // Step 3 of spec.md §4.6 (feature `mesh`): drive the dynamic
        // check-interval listen window independently of channel hop timing.
        #[cfg(feature = "mesh")]
        let mesh_listening = {
            let mode = sched.mesh_tick(&mut radio, now_ms);
            MESH_LISTEN_ACTIVE.store(mode == FilterMode::Mesh, Ordering::Relaxed);
            let frames: Vec<MeshFrame> = mesh_rx.try_iter().collect();
            sched.drain_mesh_frames(frames.into_iter(), now_ms);
            MESH_DETECTED.store(sched.mesh.mesh_detected, Ordering::Relaxed);
            sched.mesh_listening()
        };
        #[cfg(not(feature = "mesh"))]
        let mesh_listening = false;

        if sched.next_hop_due(now_ms) && !mesh_listening {
            sched.hop_tick(&mut radio, &clock, &mut rng);
            ACTIVE_COUNT.store(sched.pools.active.len() as u32, Ordering::Relaxed);
            DORMANT_COUNT.store(sched.pools.dormant.len() as u32, Ordering::Relaxed);
            PACKETS_SENT.store(sched.metrics.packets_sent, Ordering::Relaxed);
            if let Some(idx) = sched.pools.active.last().and_then(|d| d.preferred_ssid_index) {
                if let Some(ssid) = sched.store.get(idx) {
                    if let Ok(mut s) = LAST_SSID.lock() {
                        s.clear();
                        let _ = s.push_str(ssid);
                    }
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

fn status_thread() {
    loop {
        thread::sleep(Duration::from_secs(2));
        send_status();
    }
}

fn send_status() {
    let heap_free = unsafe { esp_get_free_heap_size() };
    let last_ssid = LAST_SSID.lock().map(|s| s.clone()).unwrap_or_default();
    let msg = DeviceMessage::Status {
        uptime_s: uptime_secs(),
        heap_free,
        active: ACTIVE_COUNT.load(Ordering::Relaxed),
        dormant: DORMANT_COUNT.load(Ordering::Relaxed),
        band_24: 0,
        band_5: 0,
        last_ssid: &last_ssid,
        mesh_detected: MESH_DETECTED.load(Ordering::Relaxed),
        low_memory: false,
    };

    let mut buf = [0u8; MAX_MSG_LEN];
    if let Some(len) = comm::serialize_message_line(&msg, &mut buf) {
        if let Ok(s) = std::str::from_utf8(&buf[..len]) {
            log::info!("{}", s.trim_end());
        }
    }
}

fn command_thread(cmd_rx: mpsc::Receiver<HostCommand>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let is_status_request = matches!(cmd, HostCommand::GetStatus);
        let mut cfg = *GHOSTNET_CONFIG.lock().unwrap();
        comm::handle_command(cmd, &mut cfg);
        *GHOSTNET_CONFIG.lock().unwrap() = cfg;

        if is_status_request {
            send_status();
        }
    }
}

// Serial RX (USB-CDC/UART) would feed bytes through a `LineReader` and
// push parsed commands into `cmd_tx`; board-specific wiring is omitted
// here the same way AirHound leaves its serial RX path unimplemented in
// favor of the logger-only output path.
#[allow(dead_code)]
fn feed_console_byte(reader: &mut LineReader, byte: u8) -> Option<HostCommand> {
    let line = reader.feed(byte)?;
    protocol::parse_command(line)
}
