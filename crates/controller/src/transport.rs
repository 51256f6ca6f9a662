//! Exclusive serial port access for all bus devices.
//!
//! Several devices share each RS-485 port, and several tasks talk to them
//! concurrently.  `TransportMux` owns one mutex per physical port path so a
//! full request/response cycle (flush, write, settle, read) is atomic per
//! port, while requests to different ports proceed in parallel.  Ports are
//! opened lazily on first use and reopened after an I/O failure.
//!
//! Built without the `serial` feature, a scripted in-memory link replaces
//! the real port; this is what the tests drive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::PortSettings;
use crate::protocol::{self, BusError, Response};

// ---------------------------------------------------------------------------
// Real link (serial feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "serial")]
struct Link {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl Link {
    fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, BusError> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| BusError::Port(format!("{path}: {e}")))?;
        Ok(Link { port })
    }

    fn exchange(
        &mut self,
        frame: &[u8],
        expected_len: usize,
        settle: Duration,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        use std::io::{Read, Write};

        // Drop anything a previous timed-out exchange left in the buffer.
        let _ = self.port.clear(serialport::ClearBuffer::Input);

        self.port
            .write_all(frame)
            .map_err(|e| BusError::Port(e.to_string()))?;
        std::thread::sleep(settle);

        let mut buf = vec![0u8; expected_len];
        let mut filled = 0;
        let deadline = Instant::now() + timeout;
        while filled < expected_len {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(BusError::Port(e.to_string())),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if filled == 0 {
            return Err(BusError::NoResponse);
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Mock link (no serial feature)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "serial"))]
#[derive(Default)]
struct Link {
    responses: std::collections::VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    latency: Duration,
}

#[cfg(not(feature = "serial"))]
impl Link {
    fn open(_path: &str, _baud: u32, _timeout: Duration) -> Result<Self, BusError> {
        Ok(Link::default())
    }

    fn exchange(
        &mut self,
        frame: &[u8],
        _expected_len: usize,
        _settle: Duration,
        _timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.sent.push(frame.to_vec());
        self.responses.pop_front().ok_or(BusError::NoResponse)
    }
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

struct PortState {
    link: Option<Link>,
    last_command: Option<Instant>,
}

struct PortHandle {
    path: String,
    state: Mutex<PortState>,
}

impl PortHandle {
    /// Full request cycle under the port lock.  Also enforces the minimum
    /// inter-command gap so back-to-back writes cannot overrun a board's
    /// input buffer.
    fn exchange(
        &self,
        settings: &PortSettings,
        baud: u32,
        frame: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, BusError> {
        let mut state = lock_state(&self.state);

        if let Some(last) = state.last_command {
            let gap = Duration::from_millis(settings.spacing_ms);
            let since = last.elapsed();
            if since < gap {
                std::thread::sleep(gap - since);
            }
        }

        if state.link.is_none() {
            let timeout = Duration::from_millis(settings.timeout_ms);
            state.link = Some(Link::open(&self.path, baud, timeout)?);
        }

        let result = match state.link.as_mut() {
            Some(link) => link.exchange(
                frame,
                expected_len,
                Duration::from_millis(settings.settle_ms),
                Duration::from_millis(settings.timeout_ms),
            ),
            None => Err(BusError::Port(format!("{}: not open", self.path))),
        };
        state.last_command = Some(Instant::now());

        // A port-level failure means the device or adapter went away;
        // reopen on the next request.
        if matches!(result, Err(BusError::Port(_))) {
            state.link = None;
        }
        result
    }
}

fn lock_state(mutex: &Mutex<PortState>) -> MutexGuard<'_, PortState> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared handle to every serial port in the system.  Cheap to clone via
/// `Arc`; constructed once in `main` and passed to whoever talks to the bus.
pub struct TransportMux {
    settings: PortSettings,
    ports: Mutex<HashMap<String, Arc<PortHandle>>>,
}

impl TransportMux {
    pub fn new(settings: PortSettings) -> Arc<Self> {
        Arc::new(TransportMux {
            settings,
            ports: Mutex::new(HashMap::new()),
        })
    }

    fn handle_for(&self, path: &str) -> Arc<PortHandle> {
        let mut ports = self
            .ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ports
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(PortHandle {
                    path: path.to_string(),
                    state: Mutex::new(PortState {
                        link: None,
                        last_command: None,
                    }),
                })
            })
            .clone()
    }

    /// Send one request and return the validated response.
    ///
    /// The blocking serial exchange runs on the blocking pool so requests to
    /// different ports overlap while same-port requests serialize.
    pub async fn request(
        &self,
        path: &str,
        baud: u32,
        frame: Vec<u8>,
        expected_len: usize,
    ) -> Result<Response, BusError> {
        let handle = self.handle_for(path);
        let settings = self.settings.clone();
        let raw = tokio::task::spawn_blocking(move || {
            handle.exchange(&settings, baud, &frame, expected_len)
        })
        .await
        .map_err(|e| BusError::Port(format!("exchange task failed: {e}")))??;
        protocol::parse_response(&raw)
    }
}

// ---------------------------------------------------------------------------
// Mock scripting (tests and feature-less builds)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "serial"))]
impl TransportMux {
    /// Queue a raw response frame for the next request on `path`.
    pub fn script_response(&self, path: &str, response: Vec<u8>) {
        let handle = self.handle_for(path);
        let mut state = lock_state(&handle.state);
        state
            .link
            .get_or_insert_with(Link::default)
            .responses
            .push_back(response);
    }

    /// Simulated wire latency for `path`.
    pub fn set_latency(&self, path: &str, latency: Duration) {
        let handle = self.handle_for(path);
        let mut state = lock_state(&handle.state);
        state.link.get_or_insert_with(Link::default).latency = latency;
    }

    /// Every frame written to `path`, in order.
    pub fn sent_frames(&self, path: &str) -> Vec<Vec<u8>> {
        let handle = self.handle_for(path);
        let state = lock_state(&handle.state);
        state
            .link
            .as_ref()
            .map(|l| l.sent.clone())
            .unwrap_or_default()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "serial")))]
mod tests {
    use super::*;
    use crate::protocol::crc16;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut raw = body.to_vec();
        let crc = crc16(body);
        raw.push((crc & 0xFF) as u8);
        raw.push((crc >> 8) as u8);
        raw
    }

    fn quiet_settings() -> PortSettings {
        PortSettings {
            timeout_ms: 100,
            settle_ms: 0,
            spacing_ms: 0,
            poll_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn request_returns_parsed_response() {
        let mux = TransportMux::new(quiet_settings());
        mux.script_response("/dev/ttyUSB0", framed(&[0x01, 0x03, 0x02, 0x02, 0x62]));

        let req = protocol::read_holding_registers(0x01, 0x0000, 1);
        let resp = mux.request("/dev/ttyUSB0", 9600, req, 7).await.unwrap();
        assert_eq!(resp.address, 0x01);
        assert_eq!(resp.function, 0x03);
        assert_eq!(resp.payload, vec![0x02, 0x02, 0x62]);
    }

    #[tokio::test]
    async fn missing_response_is_no_response() {
        let mux = TransportMux::new(quiet_settings());
        let req = protocol::read_holding_registers(0x01, 0x0000, 1);
        let err = mux.request("/dev/ttyUSB0", 9600, req, 7).await.unwrap_err();
        assert_eq!(err, BusError::NoResponse);
    }

    #[tokio::test]
    async fn corrupted_response_is_crc_mismatch() {
        let mux = TransportMux::new(quiet_settings());
        let mut bad = framed(&[0x01, 0x03, 0x02, 0x02, 0x62]);
        bad[3] ^= 0x01;
        mux.script_response("/dev/ttyUSB0", bad);

        let req = protocol::read_holding_registers(0x01, 0x0000, 1);
        let err = mux.request("/dev/ttyUSB0", 9600, req, 7).await.unwrap_err();
        assert!(matches!(err, BusError::CrcMismatch { .. }));
    }

    #[tokio::test]
    async fn frames_are_recorded_in_order() {
        let mux = TransportMux::new(quiet_settings());
        for _ in 0..2 {
            mux.script_response("/dev/ttyUSB0", framed(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        }

        let first = protocol::read_holding_registers(0x01, 0x0000, 1);
        let second = protocol::read_holding_registers(0x01, 0x0014, 1);
        mux.request("/dev/ttyUSB0", 9600, first.clone(), 7).await.unwrap();
        mux.request("/dev/ttyUSB0", 9600, second.clone(), 7).await.unwrap();

        assert_eq!(mux.sent_frames("/dev/ttyUSB0"), vec![first, second]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_port_requests_serialize() {
        let mux = TransportMux::new(quiet_settings());
        mux.set_latency("/dev/ttyUSB0", Duration::from_millis(50));
        for _ in 0..4 {
            mux.script_response("/dev/ttyUSB0", framed(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        }

        let start = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let mux = mux.clone();
            tasks.push(tokio::spawn(async move {
                let req = protocol::read_holding_registers(0x01, 0x0000, 1);
                mux.request("/dev/ttyUSB0", 9600, req, 7).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Four 50ms exchanges on one port cannot overlap.
        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "same-port requests overlapped: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cross_port_requests_overlap() {
        let mux = TransportMux::new(quiet_settings());
        for path in ["/dev/ttyUSB0", "/dev/ttyUSB1"] {
            mux.set_latency(path, Duration::from_millis(100));
            mux.script_response(path, framed(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        }

        let start = Instant::now();
        let a = {
            let mux = mux.clone();
            tokio::spawn(async move {
                let req = protocol::read_holding_registers(0x01, 0x0000, 1);
                mux.request("/dev/ttyUSB0", 9600, req, 7).await
            })
        };
        let b = {
            let mux = mux.clone();
            tokio::spawn(async move {
                let req = protocol::read_holding_registers(0x01, 0x0000, 1);
                mux.request("/dev/ttyUSB1", 9600, req, 7).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Two 100ms exchanges on independent ports should run concurrently.
        assert!(
            start.elapsed() < Duration::from_millis(190),
            "cross-port requests serialized: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn command_spacing_is_enforced() {
        let mut settings = quiet_settings();
        settings.spacing_ms = 80;
        let mux = TransportMux::new(settings);
        for _ in 0..2 {
            mux.script_response("/dev/ttyUSB0", framed(&[0x01, 0x03, 0x02, 0x00, 0x01]));
        }

        let start = Instant::now();
        for _ in 0..2 {
            let req = protocol::read_holding_registers(0x01, 0x0000, 1);
            mux.request("/dev/ttyUSB0", 9600, req, 7).await.unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(80),
            "second command was not spaced: {:?}",
            start.elapsed()
        );
    }
}
