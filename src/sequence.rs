//! Table-driven RTSP request/response sequencer (C8).
//!
//! A [`Sequence`] is a fixed ordered list of [`SequenceStep`]s. The reactor
//! (`crate::backend`) walks a sequence's steps, building each request with
//! [`SequenceStep::payload_maker`] and feeding the response to
//! [`SequenceStep::response_handler`], which decides whether to continue,
//! abort, or jump to a different sequence.

use tracing::warn;

use crate::protocol::rtsp::{Method, RtspRequest, RtspResponse, StatusCode};
use crate::session::Session;

/// Which sequence to run. Also used as the "jump to" target from a
/// response handler and as `Session::next_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceType {
    /// OPTIONS; may redirect to `StartRerun` on a 401 or `PinStart` on a
    /// 403.
    Start,
    /// OPTIONS with an `Authorization` header, then `StartAp2`.
    StartRerun,
    /// SETUP(session), SETPEERS, SETUP(stream), volume, RECORD.
    StartAp2,
    /// OPTIONS only, used to probe reachability before committing to a
    /// full start.
    Probe,
    /// FLUSH.
    Flush,
    /// TEARDOWN, run on both a clean stop and a fatal failure.
    StopOrFailure,
    /// POST /pair-pin-start.
    PinStart,
    /// 3x POST /pair-setup.
    PairSetup,
    /// 2x POST /pair-verify.
    PairVerify,
    /// 2x POST /pair-setup (transient/SRP-less).
    PairTransient,
    /// 1x `SET_PARAMETER` volume.
    SendVolume,
    /// 1x `SET_PARAMETER` DAAP text.
    SendText,
    /// 1x `SET_PARAMETER` progress.
    SendProgress,
    /// 1x `SET_PARAMETER` artwork.
    SendArtwork,
    /// POST /feedback keep-alive.
    Feedback,
}

/// Per-invocation data a sequence's steps need beyond what lives on
/// [`Session`] (spec §4.1 payload_maker args).
#[derive(Debug, Clone)]
pub enum SequenceArgs {
    /// No extra data needed.
    None,
    /// `device_authorize`'s PIN, carried into `PIN_START`/`PAIR_SETUP`.
    Pin(String),
    /// Paired device password, used to build a digest response on retry.
    Password(String),
    /// Volume percent for `SEND_VOLUME`.
    VolumePercent(u8),
    /// DAAP text payload bytes for `SEND_TEXT`.
    Text(Vec<u8>),
    /// `progress:` body bytes for `SEND_PROGRESS`.
    Progress(Vec<u8>),
    /// JPEG/PNG artwork bytes and its MIME type for `SEND_ARTWORK`.
    Artwork { content_type: &'static str, bytes: Vec<u8> },
}

/// What a step's `payload_maker` decided.
pub enum PayloadOutcome {
    /// Send this request.
    Send(RtspRequest),
    /// Skip this step without sending anything; advance the cursor as if
    /// it had succeeded.
    Skip,
    /// Abort the sequence; the error propagates to the session's failure
    /// path.
    Err(crate::error::AirPlayError),
}

/// What a step's `response_handler` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqResult {
    /// Advance to the next step.
    Continue,
    /// Abort the sequence; run `on_error`.
    Abort,
    /// Stop this sequence and start the named one instead, same session.
    JumpTo(SequenceType),
}

/// One request/response pair within a [`Sequence`].
pub struct SequenceStep {
    /// Builds the request to send, or decides to skip/abort.
    pub payload_maker: fn(&mut Session, &SequenceArgs) -> PayloadOutcome,
    /// Interprets the response and decides how the sequence proceeds.
    pub response_handler: fn(&mut Session, &RtspResponse) -> SeqResult,
    /// If false, any non-2xx response aborts before `response_handler`
    /// runs at all (spec §4.1 `proceed_on_rtsp_not_ok`).
    pub proceed_on_rtsp_not_ok: bool,
}

/// A named, ordered list of steps.
pub struct Sequence {
    /// Name, for logs.
    pub name: &'static str,
    /// Steps to run in order.
    pub steps: &'static [SequenceStep],
}

fn default_continue(_session: &mut Session, response: &RtspResponse) -> SeqResult {
    if response.is_success() {
        SeqResult::Continue
    } else {
        SeqResult::Abort
    }
}

/// OPTIONS response handler shared by `START`, `START_RERUN`, and
/// `PROBE`: interprets the three "Response special cases" (spec §4.1).
fn options_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    match response.status {
        StatusCode::OK => SeqResult::Continue,
        StatusCode(401) => {
            if session.digest.is_some() {
                session.reject_auth();
                SeqResult::Abort
            } else {
                let challenge = response
                    .headers
                    .get("WWW-Authenticate")
                    .unwrap_or_default()
                    .to_string();
                session.note_digest_challenge(&challenge);
                SeqResult::JumpTo(SequenceType::StartRerun)
            }
        }
        StatusCode(403) => {
            session.require_auth();
            SeqResult::JumpTo(SequenceType::PinStart)
        }
        _ => SeqResult::Abort,
    }
}

fn options_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    PayloadOutcome::Send(session.rtsp.options_request())
}

fn options_with_auth_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let mut request = session.rtsp.options_request();
    if let Some(header) = session.digest_authorization(Method::Options, &request.uri, "AirPlay", "") {
        request.headers.insert("Authorization", header);
    }
    PayloadOutcome::Send(request)
}

fn start_rerun_response_handler(_session: &mut Session, response: &RtspResponse) -> SeqResult {
    if response.is_success() {
        SeqResult::JumpTo(SequenceType::StartAp2)
    } else {
        SeqResult::Abort
    }
}

fn setup_session_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let plist = crate::protocol::plist::airplay::setup_session_request(&session.device.id);
    PayloadOutcome::Send(session.rtsp.setup_session_request(&plist, None))
}

fn setup_session_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    match response
        .body_as_plist()
        .ok()
        .and_then(|plist| crate::protocol::plist::airplay::parse_setup_session_response(&plist))
    {
        Some(timing_port) => {
            session.timing_port = timing_port;
            SeqResult::Continue
        }
        None => SeqResult::Abort,
    }
}

fn set_peers_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let addr = session.device.address().to_string();
    let plist = crate::protocol::plist::airplay::set_peers_request(&[addr]);
    let body = match crate::protocol::plist::encode(&plist) {
        Ok(bytes) => bytes,
        Err(err) => {
            return PayloadOutcome::Err(crate::error::AirPlayError::fatal(format!(
                "SETPEERS plist encode failed: {err}"
            )));
        }
    };
    PayloadOutcome::Send(session.rtsp.set_peers_request(body))
}

fn setup_stream_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let Some(secret) = session.shared_secret else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "SETUP(stream) attempted before shared secret installed",
        ));
    };
    let plist = crate::protocol::plist::airplay::setup_stream_request(&secret);
    PayloadOutcome::Send(session.rtsp.setup_session_request(&plist, None))
}

fn setup_stream_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    match response
        .body_as_plist()
        .ok()
        .and_then(|plist| crate::protocol::plist::airplay::parse_setup_stream_response(&plist))
    {
        Some((data_port, control_port)) => {
            session.data_port = data_port;
            session.control_port = control_port;
            session.set_state(crate::session::DeviceState::Setup);
            SeqResult::Continue
        }
        None => SeqResult::Abort,
    }
}

fn send_volume_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let SequenceArgs::VolumePercent(pct) = args else {
        return PayloadOutcome::Skip;
    };
    let db = crate::volume::percent_to_db(*pct, session.max_volume);
    let body = format!("volume: {}\r\n", crate::volume::format_db(db)).into_bytes();
    PayloadOutcome::Send(session.rtsp.set_parameter_request("text/parameters", body))
}

fn record_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    PayloadOutcome::Send(session.rtsp.record_request())
}

fn record_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if response.is_success() {
        session.set_state(crate::session::DeviceState::Connected);
        SeqResult::Continue
    } else {
        SeqResult::Abort
    }
}

fn flush_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let (seq, timestamp) = (0u16, 0u32);
    PayloadOutcome::Send(session.rtsp.flush_request(seq, timestamp))
}

fn teardown_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    PayloadOutcome::Send(session.rtsp.teardown_request())
}

fn teardown_response_handler(session: &mut Session, _response: &RtspResponse) -> SeqResult {
    session.set_state(crate::session::DeviceState::Stopped);
    SeqResult::Continue
}

fn pin_start_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let _ = args;
    PayloadOutcome::Send(session.rtsp.post_request(
        "/pair-pin-start",
        "application/octet-stream",
        Vec::new(),
    ))
}

fn pin_start_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if response.is_success() {
        session.set_state(crate::session::DeviceState::Password);
        SeqResult::Abort
    } else {
        SeqResult::Abort
    }
}

fn pair_setup_m1_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let SequenceArgs::Pin(pin) = args else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_SETUP step 1 requires a pin",
        ));
    };
    let mut pair_setup = crate::protocol::pairing::PairSetup::new();
    pair_setup.set_pin(pin);
    let outcome = match pair_setup.start() {
        Ok(bytes) => PayloadOutcome::Send(session.rtsp.post_request(
            "/pair-setup",
            "application/octet-stream",
            bytes,
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: true,
        }),
    };
    session.pairing = crate::session::PairingMachine::Setup(Box::new(pair_setup));
    outcome
}

fn pair_setup_m2_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let crate::session::PairingMachine::Setup(pair_setup) = &mut session.pairing else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_SETUP step 2 with no setup state",
        ));
    };
    match pair_setup.step(&[]) {
        Ok(crate::protocol::pairing::PairingStepResult::SendData(bytes)) => {
            PayloadOutcome::Send(session.rtsp.post_request(
                "/pair-setup",
                "application/octet-stream",
                bytes,
            ))
        }
        Ok(_) => PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_SETUP step 2 expected SendData",
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: true,
        }),
    }
}

fn pairing_m2_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    match &mut session.pairing {
        crate::session::PairingMachine::Setup(pair_setup) => match pair_setup.process_m2(&response.body) {
            Ok(()) => SeqResult::Continue,
            Err(err) => {
                warn!(error = %err, "PAIR_SETUP M2 processing failed");
                SeqResult::Abort
            }
        },
        crate::session::PairingMachine::Transient(transient) => match transient.process_m2(&response.body) {
            Ok(()) => SeqResult::Continue,
            Err(err) => {
                warn!(error = %err, "PAIR_TRANSIENT M2 processing failed");
                SeqResult::Abort
            }
        },
        _ => SeqResult::Abort,
    }
}

fn pair_setup_m3_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let crate::session::PairingMachine::Setup(pair_setup) = &mut session.pairing else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_SETUP step 3 with no setup state",
        ));
    };
    match pair_setup.step(&[]) {
        Ok(crate::protocol::pairing::PairingStepResult::SendData(bytes)) => {
            PayloadOutcome::Send(session.rtsp.post_request(
                "/pair-setup",
                "application/octet-stream",
                bytes,
            ))
        }
        Ok(_) => PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_SETUP step 3 expected SendData",
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: true,
        }),
    }
}

fn pair_setup_m4_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    let crate::session::PairingMachine::Setup(pair_setup) = &mut session.pairing else {
        return SeqResult::Abort;
    };
    match pair_setup.process_m4(&response.body) {
        Ok(crate::protocol::pairing::PairingStepResult::Complete(keys)) => {
            finish_pairing(session, &keys);
            session.auth_key = Some(crate::protocol::pairing::PairingKeys {
                identifier: session.device.id.clone(),
                secret_key: pair_setup.our_secret_key(),
                public_key: pair_setup.our_public_key(),
                device_public_key: pair_setup.device_public_key(),
            });
            session.clear_requires_auth();
            SeqResult::Continue
        }
        Ok(_) => SeqResult::Continue,
        Err(err) => {
            warn!(error = %err, "PAIR_SETUP M4 processing failed");
            SeqResult::Abort
        }
    }
}

fn pair_verify_m1_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let Some(auth_key) = session.auth_key.clone() else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_VERIFY requires a stored auth key",
        ));
    };
    let mut verify = crate::protocol::pairing::PairVerify::new(
        (auth_key.public_key, auth_key.secret_key),
        auth_key.device_public_key,
    );
    let outcome = match verify.start() {
        Ok(bytes) => PayloadOutcome::Send(session.rtsp.post_request(
            "/pair-verify",
            "application/octet-stream",
            bytes,
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: false,
        }),
    };
    session.pairing = crate::session::PairingMachine::Verify(Box::new(verify));
    outcome
}

fn pair_verify_m1_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        session.reject_auth();
        return SeqResult::Abort;
    }
    let crate::session::PairingMachine::Verify(verify) = &mut session.pairing else {
        return SeqResult::Abort;
    };
    match verify.process_m2(&response.body) {
        Ok(()) => SeqResult::Continue,
        Err(err) => {
            warn!(error = %err, "PAIR_VERIFY M2 processing failed");
            session.reject_auth();
            SeqResult::Abort
        }
    }
}

fn pair_verify_m2_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let crate::session::PairingMachine::Verify(verify) = &mut session.pairing else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_VERIFY step 2 with no verify state",
        ));
    };
    match verify.step(&[]) {
        Ok(crate::protocol::pairing::PairingStepResult::SendData(bytes)) => {
            PayloadOutcome::Send(session.rtsp.post_request(
                "/pair-verify",
                "application/octet-stream",
                bytes,
            ))
        }
        Ok(_) => PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_VERIFY step 2 expected SendData",
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: false,
        }),
    }
}

fn pair_verify_m2_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    let crate::session::PairingMachine::Verify(verify) = &mut session.pairing else {
        return SeqResult::Abort;
    };
    match verify.process_m4(&response.body) {
        Ok(crate::protocol::pairing::PairingStepResult::Complete(keys)) => {
            finish_pairing(session, &keys);
            SeqResult::Continue
        }
        Ok(_) => SeqResult::Continue,
        Err(err) => {
            warn!(error = %err, "PAIR_VERIFY M4 processing failed");
            SeqResult::Abort
        }
    }
}

fn pair_transient_m1_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let mut transient = crate::protocol::pairing::TransientPairing::new();
    let outcome = match transient.start() {
        Ok(bytes) => PayloadOutcome::Send(session.rtsp.post_request(
            "/pair-setup",
            "application/octet-stream",
            bytes,
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: true,
        }),
    };
    session.pairing = crate::session::PairingMachine::Transient(Box::new(transient));
    outcome
}

fn pair_transient_m1_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if response.status == StatusCode(470) {
        session.require_auth();
        return SeqResult::JumpTo(SequenceType::PinStart);
    }
    pairing_m2_response_handler(session, response)
}

fn pair_transient_m2_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    let crate::session::PairingMachine::Transient(transient) = &mut session.pairing else {
        return PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_TRANSIENT step 2 with no transient state",
        ));
    };
    match transient.step(&[]) {
        Ok(crate::protocol::pairing::PairingStepResult::SendData(bytes)) => {
            PayloadOutcome::Send(session.rtsp.post_request(
                "/pair-setup",
                "application/octet-stream",
                bytes,
            ))
        }
        Ok(_) => PayloadOutcome::Err(crate::error::AirPlayError::fatal(
            "PAIR_TRANSIENT step 2 expected SendData",
        )),
        Err(err) => PayloadOutcome::Err(crate::error::AirPlayError::AuthenticationFailed {
            message: err.to_string(),
            recoverable: true,
        }),
    }
}

fn pair_transient_m2_response_handler(session: &mut Session, response: &RtspResponse) -> SeqResult {
    if !response.is_success() {
        return SeqResult::Abort;
    }
    let crate::session::PairingMachine::Transient(transient) = &mut session.pairing else {
        return SeqResult::Abort;
    };
    match transient.process_m4(&response.body) {
        Ok(crate::protocol::pairing::PairingStepResult::Complete(keys)) => {
            finish_pairing(session, &keys);
            SeqResult::Continue
        }
        Ok(_) => SeqResult::Continue,
        Err(err) => {
            warn!(error = %err, "PAIR_TRANSIENT M4 processing failed");
            SeqResult::Abort
        }
    }
}

fn finish_pairing(session: &mut Session, keys: &crate::protocol::pairing::SessionKeys) {
    let mut raw = Vec::with_capacity(64);
    raw.extend_from_slice(&keys.encrypt_key);
    raw.extend_from_slice(&keys.decrypt_key);
    if let Err(err) = session.install_shared_secret(&raw) {
        warn!(error = %err, "failed installing shared secret");
        return;
    }
    session.control_keys = Some(keys.clone());
    session.events_keys = Some(keys.clone());
    session.pairing = crate::session::PairingMachine::None;
}

fn send_text_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let SequenceArgs::Text(body) = args else {
        return PayloadOutcome::Skip;
    };
    PayloadOutcome::Send(session.rtsp.set_parameter_request("application/x-dmap-tagged", body.clone()))
}

fn send_progress_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let SequenceArgs::Progress(body) = args else {
        return PayloadOutcome::Skip;
    };
    PayloadOutcome::Send(session.rtsp.set_parameter_request("text/parameters", body.clone()))
}

fn send_artwork_payload_maker(session: &mut Session, args: &SequenceArgs) -> PayloadOutcome {
    let SequenceArgs::Artwork { content_type, bytes } = args else {
        return PayloadOutcome::Skip;
    };
    PayloadOutcome::Send(session.rtsp.set_parameter_request(content_type, bytes.clone()))
}

fn feedback_payload_maker(session: &mut Session, _args: &SequenceArgs) -> PayloadOutcome {
    PayloadOutcome::Send(session.rtsp.post_request("/feedback", "application/x-apple-binary-plist", Vec::new()))
}

static START_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: options_payload_maker,
    response_handler: options_response_handler,
    proceed_on_rtsp_not_ok: true,
}];

static START_RERUN_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: options_with_auth_payload_maker,
    response_handler: start_rerun_response_handler,
    proceed_on_rtsp_not_ok: true,
}];

static START_AP2_STEPS: &[SequenceStep] = &[
    SequenceStep {
        payload_maker: setup_session_payload_maker,
        response_handler: setup_session_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: set_peers_payload_maker,
        response_handler: default_continue,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: setup_stream_payload_maker,
        response_handler: setup_stream_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: send_volume_payload_maker,
        response_handler: default_continue,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: record_payload_maker,
        response_handler: record_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
];

static PROBE_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: options_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static FLUSH_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: flush_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static STOP_OR_FAILURE_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: teardown_payload_maker,
    response_handler: teardown_response_handler,
    proceed_on_rtsp_not_ok: true,
}];

static PIN_START_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: pin_start_payload_maker,
    response_handler: pin_start_response_handler,
    proceed_on_rtsp_not_ok: false,
}];

static PAIR_SETUP_STEPS: &[SequenceStep] = &[
    SequenceStep {
        payload_maker: pair_setup_m1_payload_maker,
        response_handler: pairing_m2_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: pair_setup_m2_payload_maker,
        response_handler: pair_setup_m4_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
    SequenceStep {
        payload_maker: pair_setup_m3_payload_maker,
        response_handler: default_continue,
        proceed_on_rtsp_not_ok: false,
    },
];

static PAIR_VERIFY_STEPS: &[SequenceStep] = &[
    SequenceStep {
        payload_maker: pair_verify_m1_payload_maker,
        response_handler: pair_verify_m1_response_handler,
        proceed_on_rtsp_not_ok: true,
    },
    SequenceStep {
        payload_maker: pair_verify_m2_payload_maker,
        response_handler: pair_verify_m2_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
];

static PAIR_TRANSIENT_STEPS: &[SequenceStep] = &[
    SequenceStep {
        payload_maker: pair_transient_m1_payload_maker,
        response_handler: pair_transient_m1_response_handler,
        proceed_on_rtsp_not_ok: true,
    },
    SequenceStep {
        payload_maker: pair_transient_m2_payload_maker,
        response_handler: pair_transient_m2_response_handler,
        proceed_on_rtsp_not_ok: false,
    },
];

static SEND_VOLUME_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: send_volume_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static SEND_TEXT_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: send_text_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static SEND_PROGRESS_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: send_progress_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static SEND_ARTWORK_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: send_artwork_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

static FEEDBACK_STEPS: &[SequenceStep] = &[SequenceStep {
    payload_maker: feedback_payload_maker,
    response_handler: default_continue,
    proceed_on_rtsp_not_ok: false,
}];

/// Look up the step table for `kind` (spec §4.1's sequence table).
#[must_use]
pub fn sequence_for(kind: SequenceType) -> Sequence {
    let (name, steps): (&'static str, &'static [SequenceStep]) = match kind {
        SequenceType::Start => ("START", START_STEPS),
        SequenceType::StartRerun => ("START_RERUN", START_RERUN_STEPS),
        SequenceType::StartAp2 => ("START_AP2", START_AP2_STEPS),
        SequenceType::Probe => ("PROBE", PROBE_STEPS),
        SequenceType::Flush => ("FLUSH", FLUSH_STEPS),
        SequenceType::StopOrFailure => ("STOP_OR_FAILURE", STOP_OR_FAILURE_STEPS),
        SequenceType::PinStart => ("PIN_START", PIN_START_STEPS),
        SequenceType::PairSetup => ("PAIR_SETUP", PAIR_SETUP_STEPS),
        SequenceType::PairVerify => ("PAIR_VERIFY", PAIR_VERIFY_STEPS),
        SequenceType::PairTransient => ("PAIR_TRANSIENT", PAIR_TRANSIENT_STEPS),
        SequenceType::SendVolume => ("SEND_VOLUME", SEND_VOLUME_STEPS),
        SequenceType::SendText => ("SEND_TEXT", SEND_TEXT_STEPS),
        SequenceType::SendProgress => ("SEND_PROGRESS", SEND_PROGRESS_STEPS),
        SequenceType::SendArtwork => ("SEND_ARTWORK", SEND_ARTWORK_STEPS),
        SequenceType::Feedback => ("FEEDBACK", FEEDBACK_STEPS),
    };
    Sequence { name, steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AirPlayDevice, DeviceCapabilities};
    use std::collections::HashMap;
    use std::net::IpAddr;

    fn test_device() -> AirPlayDevice {
        AirPlayDevice {
            id: "AA:BB:CC:DD:EE:FF".into(),
            name: "Kitchen".into(),
            model: None,
            addresses: vec!["192.168.1.50".parse::<IpAddr>().unwrap()],
            port: 7000,
            capabilities: DeviceCapabilities::default(),
            txt_records: HashMap::new(),
            requires_auth: false,
        }
    }

    fn ok_response() -> RtspResponse {
        RtspResponse {
            version: "RTSP/1.0".into(),
            status: StatusCode::OK,
            reason: "OK".into(),
            headers: crate::protocol::rtsp::Headers::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn start_ap2_has_five_steps() {
        assert_eq!(sequence_for(SequenceType::StartAp2).steps.len(), 5);
    }

    #[test]
    fn pair_setup_has_three_steps() {
        assert_eq!(sequence_for(SequenceType::PairSetup).steps.len(), 3);
    }

    #[test]
    fn options_401_without_prior_challenge_jumps_to_start_rerun() {
        let mut session = Session::new(test_device(), 1);
        let mut response = ok_response();
        response.status = StatusCode(401);
        response.headers.insert("WWW-Authenticate", r#"Digest realm="r", nonce="n""#);
        let result = options_response_handler(&mut session, &response);
        assert_eq!(result, SeqResult::JumpTo(SequenceType::StartRerun));
        assert!(session.digest.is_some());
    }

    #[test]
    fn options_401_with_prior_challenge_aborts_to_password() {
        let mut session = Session::new(test_device(), 1);
        session.digest = Some(crate::session::DigestChallenge::parse(r#"Digest realm="r", nonce="n""#).unwrap());
        let mut response = ok_response();
        response.status = StatusCode(401);
        let result = options_response_handler(&mut session, &response);
        assert_eq!(result, SeqResult::Abort);
        assert_eq!(session.state, crate::session::DeviceState::Password);
    }

    #[test]
    fn options_403_jumps_to_pin_start() {
        let mut session = Session::new(test_device(), 1);
        let mut response = ok_response();
        response.status = StatusCode(403);
        let result = options_response_handler(&mut session, &response);
        assert_eq!(result, SeqResult::JumpTo(SequenceType::PinStart));
        assert!(session.requires_auth);
    }

    #[test]
    fn transient_470_on_step1_switches_pair_type_and_jumps() {
        let mut session = Session::new(test_device(), 1);
        session.pair_type = crate::session::PairType::HomekitTransient;
        let mut response = ok_response();
        response.status = StatusCode(470);
        let result = pair_transient_m1_response_handler(&mut session, &response);
        assert_eq!(result, SeqResult::JumpTo(SequenceType::PinStart));
        assert!(matches!(session.pair_type, crate::session::PairType::HomekitNormal));
    }
}
