//! Output backend shim (C14): the reactor that owns every device's RTSP
//! connection, the shared audio aggregators, and the control/timing
//! sockets, and exposes the player-facing operation set (spec §6).
//!
//! Every mutating call returns immediately with one of [`ASYNC_IN_PROGRESS`],
//! [`NO_OP`], or [`FATAL`] and does its real work on a spawned task, which
//! reports back through [`crate::state::EventBus`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::AirPlayError;
use crate::master_session::{AudioQuality, MasterSession, MasterSessionKey, PendingPacket};
use crate::net::secure::HapSecureSession;
use crate::net::{bind_udp, connect_tcp, spawn, spawn_blocking, Runtime, TcpStream, UdpSocket};
use crate::protocol::pairing::SessionKeys;
use crate::protocol::rtp::{ControlPacket, PacketEncryptor, RtpPacket, TimingPacket, TimingResponse};
use crate::protocol::rtsp::{Method, RtspCodec, RtspRequest, RtspResponse};
use crate::sequence::{self, PayloadOutcome, SeqResult, SequenceArgs, SequenceType};
use crate::session::{DeviceState, Session};
use crate::state::{ErrorCode, EventBus, SessionEvent};
use crate::types::{AirPlayConfig, AirPlayDevice};
use crate::volume;

/// Operation accepted; its result will surface later as a
/// [`SessionEvent`] on the device's registered callback id.
pub const ASYNC_IN_PROGRESS: i32 = 1;
/// Operation completed synchronously, or was a deliberate no-op.
pub const NO_OP: i32 = 0;
/// Operation could not be started at all.
pub const FATAL: i32 = -1;

/// One RTSP control-channel connection: TCP stream, optional HAP cipher,
/// and the incremental response parser.
struct Transport {
    stream: TcpStream,
    cipher: Option<HapSecureSession>,
    codec: RtspCodec,
    recv_buf: Vec<u8>,
    device_name: String,
}

impl Transport {
    async fn connect(device_name: &str, addr: SocketAddr) -> Result<Self, AirPlayError> {
        let stream = connect_tcp(&addr.to_string())
            .await
            .map_err(|e| AirPlayError::ConnectionFailed {
                device_name: device_name.to_string(),
                message: e.to_string(),
                source: Some(e),
            })?;
        Ok(Self {
            stream,
            cipher: None,
            codec: RtspCodec::new(),
            recv_buf: Vec::new(),
            device_name: device_name.to_string(),
        })
    }

    fn install_cipher(&mut self, keys: &SessionKeys) {
        self.cipher = Some(HapSecureSession::new(&keys.encrypt_key, &keys.decrypt_key));
    }

    async fn send(&mut self, request: &RtspRequest) -> Result<(), AirPlayError> {
        use crate::net::AsyncWriteExt;
        let mut bytes = request.encode();
        if let Some(cipher) = self.cipher.as_mut() {
            bytes = cipher.encrypt(&bytes)?;
        }
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| AirPlayError::ConnectionFailed {
                device_name: self.device_name.clone(),
                message: e.to_string(),
                source: Some(e),
            })
    }

    async fn recv(&mut self) -> Result<RtspResponse, AirPlayError> {
        loop {
            self.drain_decode()?;
            if let Some(response) = self
                .codec
                .decode()
                .map_err(|e| AirPlayError::RtspError { message: e.to_string(), status_code: None })?
            {
                return Ok(response);
            }
            use crate::net::AsyncReadExt;
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| AirPlayError::ConnectionFailed {
                    device_name: self.device_name.clone(),
                    message: e.to_string(),
                    source: Some(e),
                })?;
            if n == 0 {
                return Err(AirPlayError::Disconnected { device_name: self.device_name.clone() });
            }
            self.recv_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Feed whatever has accumulated in `recv_buf` through the HAP
    /// cipher (if installed) into the RTSP codec, leaving any
    /// not-yet-complete block in `recv_buf` for the next read.
    fn drain_decode(&mut self) -> Result<(), AirPlayError> {
        let Some(cipher) = self.cipher.as_mut() else {
            if !self.recv_buf.is_empty() {
                let bytes = std::mem::take(&mut self.recv_buf);
                self.codec
                    .feed(&bytes)
                    .map_err(|e| AirPlayError::RtspError { message: e.to_string(), status_code: None })?;
            }
            return Ok(());
        };
        loop {
            match cipher.decrypt_block(&self.recv_buf) {
                Ok((plain, rest)) => {
                    let consumed = self.recv_buf.len() - rest.len();
                    self.codec
                        .feed(&plain)
                        .map_err(|e| AirPlayError::RtspError { message: e.to_string(), status_code: None })?;
                    self.recv_buf.drain(..consumed);
                }
                Err(AirPlayError::RtspError { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Connect to a device, retrying once on the IPv4 address if the primary
/// IPv6 address fails and the device advertises dual-stack support
/// (spec §7 "IPv6 connect failure on a dual-stack device").
async fn connect_with_fallback(session: &mut Session) -> Result<Transport, AirPlayError> {
    let primary = SocketAddr::new(session.device.address(), session.device.port);
    match Transport::connect(&session.device.name, primary).await {
        Ok(transport) => Ok(transport),
        Err(primary_err) => {
            if !session.wants_ipv6_fallback() {
                return Err(primary_err);
            }
            let Some(v4) = session.device.addresses.iter().find(|a| a.is_ipv4()).copied() else {
                return Err(primary_err);
            };
            session.v6_disabled = true;
            warn!(device = %session.device.name, "IPv6 connect failed, retrying on IPv4");
            Transport::connect(&session.device.name, SocketAddr::new(v4, session.device.port)).await
        }
    }
}

/// Walk one [`sequence::Sequence`]'s steps against `transport`, honoring
/// `proceed_on_rtsp_not_ok`, `SeqResult::JumpTo`, and patching the two
/// headers the sans-IO request builders leave for the reactor to fill in
/// (spec §9 RTP-Info/Range gap).
async fn run_sequence(
    session: &mut Session,
    transport: &mut Transport,
    mut kind: SequenceType,
    args: &SequenceArgs,
    master: Option<&MasterSession>,
) -> Result<(), AirPlayError> {
    loop {
        let sequence = sequence::sequence_for(kind);
        let mut jumped = None;
        for step in sequence.steps {
            match (step.payload_maker)(session, args) {
                PayloadOutcome::Skip => continue,
                PayloadOutcome::Err(e) => return Err(e),
                PayloadOutcome::Send(mut request) => {
                    let method = request.method;
                    patch_stream_headers(&mut request, master);
                    transport.send(&request).await?;
                    let response = transport.recv().await?;
                    let _ = session.rtsp.process_response(method, &response);
                    if !response.is_success() && !step.proceed_on_rtsp_not_ok {
                        return Err(AirPlayError::RtspError {
                            message: format!(
                                "{} rejected: {} {}",
                                method.as_str(),
                                response.status.as_u16(),
                                response.reason
                            ),
                            status_code: Some(response.status.as_u16()),
                        });
                    }
                    match (step.response_handler)(session, &response) {
                        SeqResult::Continue => {}
                        SeqResult::Abort => return Ok(()),
                        SeqResult::JumpTo(next) => {
                            jumped = Some(next);
                            break;
                        }
                    }
                }
            }
        }
        match jumped {
            Some(next) => kind = next,
            None => return Ok(()),
        }
    }
}

/// Fill in the RECORD and FLUSH headers the sans-IO request builders
/// leave unset: `RtspSession::record_request` doesn't know about
/// `X-Apple-ProtocolVersion`/`Range`/`RTP-Info`, and
/// `sequence::flush_payload_maker` hardcodes `(0, 0)` for the RTP
/// position it doesn't have access to. Both are patched here, against
/// the live [`MasterSession`], rather than threading a `MasterSession`
/// reference into the sans-IO layer.
fn patch_stream_headers(request: &mut RtspRequest, master: Option<&MasterSession>) {
    match request.method {
        Method::Record => {
            request.headers.insert("X-Apple-ProtocolVersion", "1");
            request.headers.insert("Range", "npt=0-");
            if let Some(master) = master {
                request.headers.insert(
                    "RTP-Info",
                    format!("seq={};rtptime={}", master.rtp_session().sequence(), master.rtp_session().pos()),
                );
            }
        }
        Method::Flush => {
            if let Some(master) = master {
                request.headers.insert(
                    "RTP-Info",
                    format!("seq={};rtptime={}", master.rtp_session().sequence(), master.rtp_session().pos()),
                );
            }
        }
        _ => {}
    }
}

/// Everything the reactor keeps about one device beyond its [`Session`].
struct DeviceHandle {
    session: Session,
    transport: Option<Transport>,
    audio_socket: Option<Arc<UdpSocket>>,
    control_addr: Option<SocketAddr>,
    encryptor: Option<PacketEncryptor>,
    master_key: Option<MasterSessionKey>,
}

impl DeviceHandle {
    fn new(session: Session) -> Self {
        Self {
            session,
            transport: None,
            audio_socket: None,
            control_addr: None,
            encryptor: None,
            master_key: None,
        }
    }
}

fn classify(err: &AirPlayError) -> ErrorCode {
    use crate::error::ErrorKind;
    match err.kind() {
        ErrorKind::Transport | ErrorKind::Timeout => ErrorCode::Network,
        ErrorKind::AuthRequired | ErrorKind::AuthBad => ErrorCode::Authentication,
        ErrorKind::Protocol => ErrorCode::Protocol,
        ErrorKind::Encryption | ErrorKind::FatalBug => ErrorCode::Unknown,
    }
}

/// The audio quality every session streams (spec §1 Non-goals: a single
/// fixed CD-quality, HomeKit-encrypted pipeline).
fn master_key() -> MasterSessionKey {
    MasterSessionKey { quality: AudioQuality::CD_STEREO, encrypted: true }
}

/// Raw metadata handed to [`AirPlayOutput::metadata_prepare`].
pub enum MetadataInput {
    /// Opaque DMAP-tagged text, pre-encoded by the player's metadata layer.
    Text(Vec<u8>),
    /// Artwork bytes and their MIME type.
    Artwork {
        /// `image/jpeg` or `image/png`.
        content_type: &'static str,
        /// Raw image bytes.
        bytes: Vec<u8>,
    },
    /// Now-playing position, converted to a `progress:` body against the
    /// current wall-clock anchor (spec §4.9).
    Progress {
        /// Wall-clock time the player captured `pos_ms` at, milliseconds.
        pts_ms: i64,
        /// Position within the current track, milliseconds.
        pos_ms: i64,
        /// Track length, milliseconds (0 if unknown/live).
        len_ms: i64,
        /// Whether this is the first progress update after a (re)start.
        startup: bool,
    },
}

/// A metadata payload prepared off the reactor (spec §6
/// `metadata_prepare(md) -> opaque`, run on a worker thread).
enum PreparedMetadata {
    Text(Vec<u8>),
    Artwork { content_type: &'static str, bytes: Vec<u8> },
    Progress(String),
}

/// Opaque handle returned by [`AirPlayOutput::metadata_prepare`] and
/// consumed by [`AirPlayOutput::metadata_send`].
pub struct MetadataHandle {
    join: tokio::task::JoinHandle<PreparedMetadata>,
}

/// Compute the `progress: display/position/end` body (spec §4.9): the
/// position fields are expressed in RTP sample units, anchored at
/// `anchor` and corrected for the time elapsed between `pts_ms` (when
/// the player captured `pos_ms`) and now.
fn compute_progress(anchor: crate::master_session::WallClockAnchor, pts_ms: i64, pos_ms: i64, len_ms: i64, startup: bool) -> String {
    const SAMPLE_RATE: i64 = 44_100;
    const STARTUP_LEAD_SAMPLES: i64 = 15_360;
    const STEADY_LEAD_SAMPLES: i64 = 30_720;

    let elapsed_ms = pos_ms + (anchor.ts_ms - pts_ms);
    let elapsed_samples = elapsed_ms * SAMPLE_RATE / 1000;
    let start = anchor.pos - elapsed_samples;
    let lead = if startup { STARTUP_LEAD_SAMPLES } else { STEADY_LEAD_SAMPLES };
    let display = start - lead;
    let position = anchor.pos.max(start);
    let len_samples = len_ms * SAMPLE_RATE / 1000;
    let end = if len_samples != 0 { start + len_samples } else { position };

    format!("progress: {display}/{position}/{end}\r\n")
}

/// The `AirPlay` 2 output backend: one reactor owning every paired
/// device's control connection, the shared per-quality audio
/// aggregators, and the shared control/timing UDP sockets.
pub struct AirPlayOutput {
    config: AirPlayConfig,
    devices: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<DeviceHandle>>>>>,
    devices_by_addr: Arc<StdMutex<HashMap<IpAddr, String>>>,
    master_sessions: Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
    events: Arc<EventBus>,
    reactor_tasks: Arc<StdMutex<Vec<tokio::task::JoinHandle<()>>>>,
    pending_sends: Arc<StdMutex<Vec<tokio::task::JoinHandle<()>>>>,
    /// Per-device id `requires_auth` flag, kept across `device_stop` ->
    /// `device_start` cycles where the caller's `AirPlayDevice` value
    /// doesn't itself carry the flag forward (spec §7).
    auth_required: Arc<StdMutex<HashMap<String, bool>>>,
    ssrc: u32,
}

impl AirPlayOutput {
    /// Build a backend from configuration, not yet bound to any sockets
    /// (spec §6 `init`/`deinit` own that lifecycle).
    #[must_use]
    pub fn new(config: AirPlayConfig) -> Self {
        Self {
            config,
            devices: Arc::new(StdMutex::new(HashMap::new())),
            devices_by_addr: Arc::new(StdMutex::new(HashMap::new())),
            master_sessions: Arc::new(AsyncMutex::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
            reactor_tasks: Arc::new(StdMutex::new(Vec::new())),
            pending_sends: Arc::new(StdMutex::new(Vec::new())),
            auth_required: Arc::new(StdMutex::new(HashMap::new())),
            ssrc: rand::random(),
        }
    }

    /// Subscribe to state-change/error notifications for one callback id.
    #[must_use]
    pub fn events_for(&self, callback_id: u64) -> crate::state::EventFilter {
        crate::state::EventFilter::for_callback(&self.events, callback_id)
    }

    /// Bind the shared control and timing sockets and start the
    /// background listener/maintenance tasks (spec §6 `init`).
    pub fn init(&self) -> i32 {
        let shared = self.config.airplay_shared.clone();
        let devices = self.devices.clone();
        let devices_by_addr = self.devices_by_addr.clone();
        let master_sessions = self.master_sessions.clone();
        let events = self.events.clone();
        let reactor_tasks = self.reactor_tasks.clone();

        spawn(async move {
            let control = match bind_udp(&format!("0.0.0.0:{}", shared.control_port)).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!(error = %e, "failed binding control socket");
                    return;
                }
            };
            let timing = match bind_udp(&format!("0.0.0.0:{}", shared.timing_port)).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!(error = %e, "failed binding timing socket");
                    return;
                }
            };

            let mut tasks = reactor_tasks.lock().unwrap();
            tasks.push(spawn(control_listener_loop(
                control.clone(),
                devices.clone(),
                devices_by_addr,
                master_sessions.clone(),
                events.clone(),
            )));
            tasks.push(spawn(timing_listener_loop(timing)));
            tasks.push(spawn(maintenance_loop(devices, master_sessions, control, events)));
        });
        ASYNC_IN_PROGRESS
    }

    /// Tear down every background task and forget all device state
    /// (spec §6 `deinit`).
    pub fn deinit(&self) -> i32 {
        for task in self.reactor_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for task in self.pending_sends.lock().unwrap().drain(..) {
            task.abort();
        }
        self.devices.lock().unwrap().clear();
        self.devices_by_addr.lock().unwrap().clear();
        let master_sessions = self.master_sessions.clone();
        spawn(async move {
            master_sessions.lock().await.clear();
        });
        NO_OP
    }

    /// Probe reachability without committing to a full start (spec §6
    /// `device_probe`): runs the `PROBE` sequence on a throwaway
    /// connection and discards it either way.
    pub fn device_probe(&self, device: AirPlayDevice, callback_id: u64) -> i32 {
        let events = self.events.clone();
        spawn(async move {
            let mut session = Session::new(device, callback_id);
            let result = async {
                let mut transport = connect_with_fallback(&mut session).await?;
                run_sequence(&mut session, &mut transport, SequenceType::Probe, &SequenceArgs::None, None).await
            }
            .await;
            if let Err(e) = result {
                events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
            }
        });
        ASYNC_IN_PROGRESS
    }

    /// Register (or replace) the callback id a device's events target
    /// (spec §6 `device_cb_set`).
    pub fn device_cb_set(&self, device: &AirPlayDevice, callback_id: u64) -> i32 {
        let Some(handle) = self.devices.lock().unwrap().get(&device.id).cloned() else {
            return FATAL;
        };
        spawn(async move {
            handle.lock().await.session.callback_id = callback_id;
        });
        NO_OP
    }

    /// Forget any per-address routing state kept for a device after the
    /// player releases it (spec §6 `device_free_extra`).
    pub fn device_free_extra(&self, device: &AirPlayDevice) -> i32 {
        self.devices_by_addr.lock().unwrap().retain(|_, id| id != &device.id);
        NO_OP
    }

    /// Connect, pair (if needed), and run the full `START`/`START_AP2`
    /// handshake through `RECORD` (spec §6 `device_start`).
    pub fn device_start(&self, device: AirPlayDevice, callback_id: u64) -> i32 {
        if self.config.device_config(&device.name).exclude {
            return NO_OP;
        }
        self.spawn_start(device, callback_id, SequenceArgs::None)
    }

    /// Resume a start that stopped at `PIN_START` with the user-supplied
    /// PIN (spec §6 `device_authorize`).
    pub fn device_authorize(&self, device: AirPlayDevice, pin: String, callback_id: u64) -> i32 {
        self.spawn_start(device, callback_id, SequenceArgs::Pin(pin))
    }

    fn spawn_start(&self, mut device: AirPlayDevice, callback_id: u64, args: SequenceArgs) -> i32 {
        let devices = self.devices.clone();
        let devices_by_addr = self.devices_by_addr.clone();
        let master_sessions = self.master_sessions.clone();
        let events = self.events.clone();
        let auth_required = self.auth_required.clone();
        let max_volume = self.config.device_config(&device.name).max_volume;

        spawn(async move {
            let device_id = device.id.clone();
            let address = device.address();

            let existing = devices.lock().unwrap().get(&device_id).cloned();
            let handle = match existing {
                Some(handle) => handle,
                None => {
                    if auth_required.lock().unwrap().get(&device_id).copied().unwrap_or(false) {
                        device.requires_auth = true;
                    }
                    let mut session = Session::new(device, callback_id);
                    session.max_volume = volume::clamp_max_volume(max_volume);
                    let handle = Arc::new(AsyncMutex::new(DeviceHandle::new(session)));
                    devices.lock().unwrap().insert(device_id.clone(), handle.clone());
                    handle
                }
            };
            devices_by_addr.lock().unwrap().insert(address, device_id.clone());

            let mut guard = handle.lock().await;
            guard.session.callback_id = callback_id;
            let old_state = guard.session.state;

            let result = finish_start(&mut guard, &args, &master_sessions).await;
            auth_required.lock().unwrap().insert(device_id, guard.session.requires_auth);

            match result {
                Ok(()) if guard.session.state == DeviceState::Password => {
                    events.emit(SessionEvent::AuthRequired { callback_id, device: guard.session.device.clone() });
                }
                Ok(()) => {
                    if guard.session.state != old_state {
                        events.emit(SessionEvent::StateChanged { callback_id, old: old_state, new: guard.session.state });
                    }
                }
                Err(e) => {
                    events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
                }
            }
        });
        ASYNC_IN_PROGRESS
    }

    /// Run `TEARDOWN` and release every resource a device holds (spec §6
    /// `device_stop`).
    pub fn device_stop(&self, device: &AirPlayDevice, callback_id: u64) -> i32 {
        let Some(handle) = self.devices.lock().unwrap().remove(&device.id) else {
            return NO_OP;
        };
        self.devices_by_addr.lock().unwrap().retain(|_, id| id != &device.id);
        let master_sessions = self.master_sessions.clone();
        let events = self.events.clone();

        spawn(async move {
            let mut guard = handle.lock().await;
            let old_state = guard.session.state;
            if let Some(mut transport) = guard.transport.take() {
                if let Err(e) =
                    run_sequence(&mut guard.session, &mut transport, SequenceType::StopOrFailure, &SequenceArgs::None, None).await
                {
                    events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
                }
            } else {
                guard.session.set_state(DeviceState::Stopped);
            }
            if let Some(key) = guard.master_key.take() {
                let mut sessions = master_sessions.lock().await;
                if let Some(master) = sessions.get_mut(&key) {
                    if master.detach() {
                        sessions.remove(&key);
                    }
                }
            }
            events.emit(SessionEvent::StateChanged { callback_id, old: old_state, new: guard.session.state });
        });
        ASYNC_IN_PROGRESS
    }

    /// Run `FLUSH` and drop back to `CONNECTED` (spec §6 `device_flush`).
    pub fn device_flush(&self, device: &AirPlayDevice, callback_id: u64) -> i32 {
        let Some(handle) = self.devices.lock().unwrap().get(&device.id).cloned() else {
            return NO_OP;
        };
        let master_sessions = self.master_sessions.clone();
        let events = self.events.clone();

        spawn(async move {
            let mut guard = handle.lock().await;
            let Some(mut transport) = guard.transport.take() else {
                return;
            };
            let key = guard.master_key;
            let result = {
                let sessions = master_sessions.lock().await;
                let master = key.and_then(|k| sessions.get(&k));
                run_sequence(&mut guard.session, &mut transport, SequenceType::Flush, &SequenceArgs::None, master).await
            };
            guard.transport = Some(transport);
            match result {
                Ok(()) => {
                    guard.session.set_state(DeviceState::Connected);
                }
                Err(e) => {
                    events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
                }
            }
        });
        ASYNC_IN_PROGRESS
    }

    /// Set a device's volume from a 0-100 percent value (spec §6
    /// `device_volume_set`; the percent parameter is not spelled out in
    /// the two-argument op listing but the op is meaningless without
    /// one, see `DESIGN.md`).
    pub fn device_volume_set(&self, device: &AirPlayDevice, pct: u8, callback_id: u64) -> i32 {
        let Some(handle) = self.devices.lock().unwrap().get(&device.id).cloned() else {
            return NO_OP;
        };
        let events = self.events.clone();
        spawn(async move {
            let mut guard = handle.lock().await;
            let Some(mut transport) = guard.transport.take() else {
                return;
            };
            let result =
                run_sequence(&mut guard.session, &mut transport, SequenceType::SendVolume, &SequenceArgs::VolumePercent(pct), None)
                    .await;
            guard.transport = Some(transport);
            if let Err(e) = result {
                events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
            }
        });
        ASYNC_IN_PROGRESS
    }

    /// Pure conversion from a `"volume: <dB>"`-style string to a 0-100
    /// percent value against a device's configured max volume (spec §6
    /// `device_volume_to_pct`).
    #[must_use]
    pub fn device_volume_to_pct(&self, device: &AirPlayDevice, db_string: &str) -> u8 {
        let max_volume = self.config.device_config(&device.name).max_volume;
        let db: f32 = db_string.trim().parse().unwrap_or(volume::MUTE_DB);
        volume::db_to_percent(db, max_volume)
    }

    /// Append PCM samples to the shared aggregator and push any whole
    /// packets they complete to every attached, streaming device (spec
    /// §6 `write`, §4.2, §4.4).
    pub fn write(&self, pcm_bytes: Vec<u8>, pts_ms: i64) -> i32 {
        let master_sessions = self.master_sessions.clone();
        let devices = self.devices.clone();
        let events = self.events.clone();
        let ssrc = self.ssrc;

        spawn(async move {
            let key = master_key();
            let packets = {
                let mut sessions = master_sessions.lock().await;
                let Some(master) = sessions.get_mut(&key) else { return };
                master.timestamp_set(pts_ms);
                master.push_samples(&pcm_bytes);
                let pending: Vec<PendingPacket> = master.drain_packets(ssrc);
                pending.iter().map(|p| master.commit_to_ring(p, false)).collect::<Vec<_>>()
            };
            if packets.is_empty() {
                return;
            }

            let handles: Vec<_> = devices.lock().unwrap().values().cloned().collect();
            for handle in handles {
                let mut guard = handle.lock().await;
                if guard.master_key != Some(key) {
                    continue;
                }
                let Some(encryptor) = guard.encryptor.as_ref() else { continue };
                let Some(socket) = guard.audio_socket.clone() else { continue };
                let callback_id = guard.session.callback_id;

                for packet in &packets {
                    let mut packet = packet.clone();
                    match guard.session.state {
                        DeviceState::Connected => {
                            packet.header.marker = true;
                            guard.session.set_state(DeviceState::Streaming);
                        }
                        DeviceState::Streaming => {}
                        _ => continue,
                    }
                    match encryptor.encrypt(&packet.header, &packet.payload) {
                        Ok(wire) => {
                            if let Err(e) = socket.send(&wire).await {
                                events.emit(SessionEvent::Error { callback_id, code: ErrorCode::Network, message: e.to_string() });
                            }
                        }
                        Err(e) => {
                            events.emit(SessionEvent::Error { callback_id, code: ErrorCode::Playback, message: e.to_string() });
                        }
                    }
                }
            }
        });
        ASYNC_IN_PROGRESS
    }

    /// Prepare a metadata payload off the reactor (spec §6
    /// `metadata_prepare(md) -> opaque`, run on a worker thread).
    #[must_use]
    pub fn metadata_prepare(&self, input: MetadataInput) -> MetadataHandle {
        let master_sessions = self.master_sessions.clone();
        let join = spawn(async move {
            match input {
                MetadataInput::Text(bytes) => spawn_blocking(move || PreparedMetadata::Text(bytes))
                    .await
                    .unwrap_or_else(|_| PreparedMetadata::Text(Vec::new())),
                MetadataInput::Artwork { content_type, bytes } => {
                    spawn_blocking(move || PreparedMetadata::Artwork { content_type, bytes })
                        .await
                        .unwrap_or(PreparedMetadata::Artwork { content_type: "image/jpeg", bytes: Vec::new() })
                }
                MetadataInput::Progress { pts_ms, pos_ms, len_ms, startup } => {
                    let anchor = {
                        let sessions = master_sessions.lock().await;
                        sessions.get(&master_key()).map_or_else(Default::default, MasterSession::cur_stamp)
                    };
                    spawn_blocking(move || PreparedMetadata::Progress(compute_progress(anchor, pts_ms, pos_ms, len_ms, startup)))
                        .await
                        .unwrap_or_else(|_| PreparedMetadata::Progress(String::new()))
                }
            }
        });
        MetadataHandle { join }
    }

    /// Send a previously prepared metadata payload to every connected
    /// device (spec §6 `metadata_send`).
    pub fn metadata_send(&self, handle: MetadataHandle) -> i32 {
        let devices = self.devices.clone();
        let events = self.events.clone();
        let task = spawn(async move {
            let prepared = match handle.join.await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "metadata preparation task failed");
                    return;
                }
            };
            let handles: Vec<_> = devices.lock().unwrap().values().cloned().collect();
            for device_handle in handles {
                let mut guard = device_handle.lock().await;
                if !matches!(guard.session.state, DeviceState::Connected | DeviceState::Streaming) {
                    continue;
                }
                let Some(mut transport) = guard.transport.take() else { continue };
                let callback_id = guard.session.callback_id;
                let (kind, args) = match &prepared {
                    PreparedMetadata::Text(bytes) => (SequenceType::SendText, SequenceArgs::Text(bytes.clone())),
                    PreparedMetadata::Artwork { content_type, bytes } => {
                        (SequenceType::SendArtwork, SequenceArgs::Artwork { content_type: *content_type, bytes: bytes.clone() })
                    }
                    PreparedMetadata::Progress(body) => (SequenceType::SendProgress, SequenceArgs::Progress(body.clone().into_bytes())),
                };
                let result = run_sequence(&mut guard.session, &mut transport, kind, &args, None).await;
                guard.transport = Some(transport);
                if let Err(e) = result {
                    events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
                }
            }
        });
        self.pending_sends.lock().unwrap().push(task);
        ASYNC_IN_PROGRESS
    }

    /// Cancel any metadata sends still in flight (spec §6
    /// `metadata_purge`).
    pub fn metadata_purge(&self) -> i32 {
        for task in self.pending_sends.lock().unwrap().drain(..) {
            task.abort();
        }
        NO_OP
    }
}

/// Connect (if needed), pair, install the HAP cipher, and run the
/// `START`/`START_AP2` handshake through `RECORD`. Shared by
/// `device_start` and `device_authorize`.
///
/// A hard failure after a successful connect (refused RTSP exchange,
/// dropped socket, malformed response) retries once on the device's IPv4
/// address if it's still eligible for the dual-stack fallback (spec §4.1,
/// §7 "IPv6 connect failure on a dual-stack device" extends to any hard
/// failure during START, not just the initial connect).
async fn finish_start(
    guard: &mut DeviceHandle,
    args: &SequenceArgs,
    master_sessions: &Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
) -> Result<(), AirPlayError> {
    if guard.transport.is_none() {
        guard.transport = Some(connect_with_fallback(&mut guard.session).await?);
    }

    let result = finish_start_once(guard, args, master_sessions).await;

    match result {
        Err(e)
            if matches!(
                e.kind(),
                crate::error::ErrorKind::Transport | crate::error::ErrorKind::Protocol | crate::error::ErrorKind::Timeout
            ) && guard.session.wants_ipv6_fallback() =>
        {
            warn!(device = %guard.session.device.name, error = %e, "post-connect START failed over IPv6, retrying on IPv4");
            retry_start_over_ipv4(guard, args, master_sessions).await
        }
        other => other,
    }
}

/// Run one attempt of the pairing/START/RECORD sequence against
/// `guard`'s current transport, leaving the transport installed in
/// `guard` whether it succeeds or fails.
async fn finish_start_once(
    guard: &mut DeviceHandle,
    args: &SequenceArgs,
    master_sessions: &Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
) -> Result<(), AirPlayError> {
    let Some(mut transport) = guard.transport.take() else {
        return Err(AirPlayError::fatal("no transport after connect"));
    };

    let pairing_kind = match args {
        SequenceArgs::Pin(_) => SequenceType::PairSetup,
        _ => guard.session.startup_pairing_sequence(),
    };

    let result = (|| async {
        run_sequence(&mut guard.session, &mut transport, pairing_kind, args, None).await?;
        if guard.session.state == DeviceState::Password {
            return Ok(());
        }
        if let Some(keys) = guard.session.control_keys.clone() {
            transport.install_cipher(&keys);
        }

        let key = master_key();
        if guard.master_key.is_none() {
            let mut sessions = master_sessions.lock().await;
            let master = sessions.entry(key).or_insert_with(|| MasterSession::new(key, 0));
            master.attach();
            guard.master_key = Some(key);
        }

        let sessions = master_sessions.lock().await;
        let master = sessions.get(&key);
        run_sequence(&mut guard.session, &mut transport, SequenceType::Start, &SequenceArgs::None, master).await?;

        if guard.session.state == DeviceState::Connected {
            if let Some(secret) = guard.session.shared_secret {
                guard.encryptor = Some(PacketEncryptor::new(&secret)?);
            }
            let audio_addr = SocketAddr::new(guard.session.device.address(), guard.session.data_port);
            let socket = bind_udp("0.0.0.0:0").await.map_err(|e| AirPlayError::ConnectionFailed {
                device_name: guard.session.device.name.clone(),
                message: e.to_string(),
                source: Some(e),
            })?;
            socket.connect(audio_addr).await.map_err(|e| AirPlayError::ConnectionFailed {
                device_name: guard.session.device.name.clone(),
                message: e.to_string(),
                source: Some(e),
            })?;
            guard.audio_socket = Some(Arc::new(socket));
            guard.control_addr = Some(SocketAddr::new(guard.session.device.address(), guard.session.control_port));
        }
        Ok(())
    })()
    .await;

    guard.transport = Some(transport);
    result
}

/// Tear down the partially-attached master session and transport, mark
/// IPv6 disabled, reconnect on the device's IPv4 address, and re-run the
/// sequence once from a clean state.
async fn retry_start_over_ipv4(
    guard: &mut DeviceHandle,
    args: &SequenceArgs,
    master_sessions: &Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
) -> Result<(), AirPlayError> {
    let Some(v4) = guard.session.device.addresses.iter().find(|a| a.is_ipv4()).copied() else {
        return Err(AirPlayError::fatal("IPv6 fallback requested with no IPv4 address"));
    };

    if let Some(key) = guard.master_key.take() {
        let mut sessions = master_sessions.lock().await;
        if let Some(master) = sessions.get_mut(&key) {
            if master.detach() {
                sessions.remove(&key);
            }
        }
    }

    guard.session.v6_disabled = true;
    guard.session.set_state(DeviceState::Stopped);
    guard.transport = None;
    guard.audio_socket = None;
    guard.control_addr = None;
    guard.encryptor = None;

    let transport = Transport::connect(&guard.session.device.name, SocketAddr::new(v4, guard.session.device.port)).await?;
    guard.transport = Some(transport);
    finish_start_once(guard, args, master_sessions).await
}

/// Demux retransmit requests arriving on the shared control socket to
/// the device that sent them, serve hits from the retransmit ring, and
/// log misses (spec §4.6, §8 scenario S3).
async fn control_listener_loop(
    socket: Arc<UdpSocket>,
    devices: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<DeviceHandle>>>>>,
    devices_by_addr: Arc<StdMutex<HashMap<IpAddr, String>>>,
    master_sessions: Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
    events: Arc<EventBus>,
) {
    let mut buf = [0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "control socket recv failed");
                continue;
            }
        };
        let request = match ControlPacket::decode(&buf[..n]) {
            Ok(ControlPacket::RetransmitRequest(req)) => req,
            Ok(ControlPacket::Sync { .. }) => continue,
            Err(e) => {
                debug!(error = %e, "unparseable control packet");
                continue;
            }
        };
        let Some(device_id) = devices_by_addr.lock().unwrap().get(&from.ip()).cloned() else { continue };
        let Some(handle) = devices.lock().unwrap().get(&device_id).cloned() else { continue };
        let guard = handle.lock().await;
        let (Some(key), Some(socket_out), Some(encryptor)) = (guard.master_key, guard.audio_socket.clone(), guard.encryptor.as_ref())
        else {
            continue;
        };
        let callback_id = guard.session.callback_id;

        let sessions = master_sessions.lock().await;
        let Some(master) = sessions.get(&key) else { continue };

        for i in 0..request.count {
            let seq = request.sequence_start.wrapping_add(i);
            match master.retransmit(seq).and_then(|wire| RtpPacket::decode(wire).ok()) {
                Some(packet) => {
                    if let Ok(reencrypted) = encryptor.encrypt(&packet.header, &packet.payload) {
                        let _ = socket_out.send(&reencrypted).await;
                    }
                }
                None => {
                    events.emit(SessionEvent::RetransmitMiss { callback_id, sequence: seq });
                }
            }
        }
    }
}

/// Answer timing requests on the shared timing socket with the local
/// wall clock (spec §4.3/C5).
async fn timing_listener_loop(socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "timing socket recv failed");
                continue;
            }
        };
        match TimingPacket::decode(&buf[..n]) {
            Ok(TimingPacket::Request(request)) => {
                let response = TimingResponse::for_request(&request, crate::protocol::rtp::NtpTimestamp::now(), crate::protocol::rtp::NtpTimestamp::now());
                let _ = socket.send_to(&response.encode(), from).await;
            }
            Ok(TimingPacket::Response(_)) => {}
            Err(e) => debug!(error = %e, "unparseable timing packet"),
        }
    }
}

/// Per-second housekeeping: send the `FEEDBACK` keep-alive to idle
/// devices (spec §3 `KEEPALIVE_INTERVAL`) and steady-state sync packets
/// to streaming ones (spec §4.3).
async fn maintenance_loop(
    devices: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<DeviceHandle>>>>>,
    master_sessions: Arc<AsyncMutex<HashMap<MasterSessionKey, MasterSession>>>,
    control_socket: Arc<UdpSocket>,
    events: Arc<EventBus>,
) {
    loop {
        Runtime::sleep(std::time::Duration::from_secs(1)).await;
        let handles: Vec<_> = devices.lock().unwrap().values().cloned().collect();
        for handle in handles {
            let mut guard = handle.lock().await;
            let callback_id = guard.session.callback_id;

            if guard.session.wants_keepalive() {
                if let Some(mut transport) = guard.transport.take() {
                    let result =
                        run_sequence(&mut guard.session, &mut transport, SequenceType::Feedback, &SequenceArgs::None, None).await;
                    guard.transport = Some(transport);
                    if let Err(e) = result {
                        events.emit(SessionEvent::Error { callback_id, code: classify(&e), message: e.to_string() });
                    }
                }
            }

            if guard.session.state == DeviceState::Streaming {
                if let (Some(key), Some(control_addr)) = (guard.master_key, guard.control_addr) {
                    let mut sessions = master_sessions.lock().await;
                    if let Some(master) = sessions.get_mut(&key) {
                        if master.rtp_session().sync_due() {
                            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            let next_timestamp = master.rtp_session().pos() as u32;
                            let packet = master.sync_packet(false, next_timestamp);
                            master.note_sync_sent();
                            let _ = control_socket.send_to(&packet.encode(), control_addr).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master_session::WallClockAnchor;
    use crate::protocol::rtsp::RtspRequest;
    use crate::types::DeviceCapabilities;
    use std::collections::HashMap as Map;

    fn test_device() -> AirPlayDevice {
        AirPlayDevice {
            id: "AA:BB:CC:DD:EE:FF".into(),
            name: "Kitchen".into(),
            model: None,
            addresses: vec!["192.168.1.50".parse().unwrap()],
            port: 7000,
            capabilities: DeviceCapabilities::default(),
            txt_records: Map::new(),
            requires_auth: false,
        }
    }

    #[test]
    fn classify_maps_transport_errors_to_network() {
        let err = AirPlayError::Disconnected { device_name: "Kitchen".into() };
        assert_eq!(classify(&err), ErrorCode::Network);
    }

    #[test]
    fn classify_maps_recoverable_auth_to_authentication() {
        let err = AirPlayError::AuthenticationFailed { message: "pin needed".into(), recoverable: true };
        assert_eq!(classify(&err), ErrorCode::Authentication);
    }

    #[test]
    fn classify_maps_rtsp_error_to_protocol() {
        let err = AirPlayError::RtspError { message: "bad status".into(), status_code: Some(454) };
        assert_eq!(classify(&err), ErrorCode::Protocol);
    }

    #[test]
    fn master_key_is_cd_stereo_and_encrypted() {
        let key = master_key();
        assert!(key.encrypted);
        assert_eq!(key.quality, AudioQuality::CD_STEREO);
    }

    #[test]
    fn patch_stream_headers_fills_record_fixed_headers() {
        let mut request = RtspRequest::new(Method::Record, "rtsp://192.168.1.50/1");
        patch_stream_headers(&mut request, None);
        assert_eq!(request.headers.get("X-Apple-ProtocolVersion"), Some("1"));
        assert_eq!(request.headers.get("Range"), Some("npt=0-"));
        assert!(request.headers.get("RTP-Info").is_none());
    }

    #[test]
    fn patch_stream_headers_adds_rtp_info_from_master() {
        let master = MasterSession::new(master_key(), 0);
        let mut request = RtspRequest::new(Method::Record, "rtsp://192.168.1.50/1");
        patch_stream_headers(&mut request, Some(&master));
        let rtp_info = request.headers.get("RTP-Info").unwrap();
        assert!(rtp_info.starts_with("seq=0;rtptime=0"));
    }

    #[test]
    fn patch_stream_headers_leaves_other_methods_untouched() {
        let mut request = RtspRequest::new(Method::Options, "*");
        patch_stream_headers(&mut request, None);
        assert!(request.headers.get("X-Apple-ProtocolVersion").is_none());
        assert!(request.headers.get("Range").is_none());
    }

    #[test]
    fn patch_stream_headers_flush_only_sets_rtp_info() {
        let master = MasterSession::new(master_key(), 0);
        let mut request = RtspRequest::new(Method::Flush, "rtsp://192.168.1.50/1");
        patch_stream_headers(&mut request, Some(&master));
        assert!(request.headers.get("RTP-Info").is_some());
        assert!(request.headers.get("Range").is_none());
    }

    #[test]
    fn compute_progress_falls_back_to_position_when_length_unknown() {
        let anchor = WallClockAnchor { ts_ms: 1_000, pos: 44_100 };
        let body = compute_progress(anchor, 1_000, 0, 0, true);
        // position == anchor.pos since elapsed is zero; end falls back to position.
        assert!(body.starts_with("progress: "));
        let nums: Vec<i64> = body
            .trim_start_matches("progress: ")
            .trim_end()
            .split('/')
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(nums[1], nums[2]);
    }

    #[test]
    fn compute_progress_uses_shorter_lead_on_startup() {
        let anchor = WallClockAnchor { ts_ms: 1_000, pos: 100_000 };
        let startup = compute_progress(anchor, 1_000, 0, 0, true);
        let steady = compute_progress(anchor, 1_000, 0, 0, false);
        let display_of = |body: &str| -> i64 {
            body.trim_start_matches("progress: ").split('/').next().unwrap().parse().unwrap()
        };
        assert!(display_of(&startup) > display_of(&steady));
    }

    #[tokio::test]
    async fn device_free_extra_removes_only_matching_device() {
        let output = AirPlayOutput::new(AirPlayConfig::default());
        let device = test_device();
        output.devices_by_addr.lock().unwrap().insert(device.address(), device.id.clone());
        output.devices_by_addr.lock().unwrap().insert("10.0.0.9".parse().unwrap(), "other".into());
        assert_eq!(output.device_free_extra(&device), NO_OP);
        let remaining = output.devices_by_addr.lock().unwrap();
        assert!(!remaining.values().any(|id| id == &device.id));
        assert!(remaining.values().any(|id| id == "other"));
    }

    #[tokio::test]
    async fn device_cb_set_on_unknown_device_is_fatal() {
        let output = AirPlayOutput::new(AirPlayConfig::default());
        assert_eq!(output.device_cb_set(&test_device(), 42), FATAL);
    }

    #[tokio::test]
    async fn device_stop_on_unknown_device_is_no_op() {
        let output = AirPlayOutput::new(AirPlayConfig::default());
        assert_eq!(output.device_stop(&test_device(), 1), NO_OP);
    }

    #[tokio::test]
    async fn device_volume_to_pct_is_pure_and_synchronous() {
        let output = AirPlayOutput::new(AirPlayConfig::default());
        let pct = output.device_volume_to_pct(&test_device(), "0.0");
        assert_eq!(pct, 100);
    }
}
