//! The reference client sequence
//!
//! Everything goes through the control-code ABI, exactly as a user-mode
//! client would drive the device: register for notifications, wait for the
//! peer, share the setup message, release it and wait for the peer to leave.

use crate::config::MessageConfig;
use crate::error::ClientError;
use crate::payload::MsgSetup;
use crate::sim::{SimPlatform, Simulation};
use libporthole::{
    PortholeEvents, PortholeMsg, Status, IOCTL_PORTHOLE_REGISTER_EVENTS, IOCTL_PORTHOLE_SEND_MSG,
    IOCTL_PORTHOLE_UNLOCK_BUFFER, MAP_ID_SIZE,
};
use porthole::traits::Platform;
use porthole::{dispatch, ClientContext};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a completed session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Mapping id the device assigned
    pub map_id: u32,
    /// Segments the buffer was described with
    pub segments: usize,
    /// Bytes shared
    pub payload_len: usize,
}

fn request<P: Platform>(
    client: &ClientContext<P>,
    operation: &'static str,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<(), ClientError> {
    let completion = dispatch(client, code, input, output);
    debug!(operation, status = %completion.status, information = completion.information, "request completed");

    match completion.status {
        Status::Success => Ok(()),
        status => Err(ClientError::Request { operation, status }),
    }
}

/// Run the reference sequence against a running simulation
pub fn run(sim: &Simulation, message: &MessageConfig, wait: Duration) -> Result<SessionReport, ClientError> {
    let device = sim.device();
    let platform = device.platform();
    let client = device.open_client();

    let connect = platform.create_event();
    let disconnect = platform.create_event();
    let result = exchange(sim, &client, message, wait, connect, disconnect);

    drop(client);
    platform.close_event(connect);
    platform.close_event(disconnect);
    result
}

fn exchange(
    sim: &Simulation,
    client: &ClientContext<SimPlatform>,
    message: &MessageConfig,
    wait: Duration,
    connect: u64,
    disconnect: u64,
) -> Result<SessionReport, ClientError> {
    let platform = sim.device().platform();

    let events = PortholeEvents { connect, disconnect };
    request(client, "register events", IOCTL_PORTHOLE_REGISTER_EVENTS, &events.to_bytes(), &mut [])?;

    info!("waiting for the peer");
    if !platform.wait_event(connect, wait) {
        return Err(ClientError::EventTimeout("connect"));
    }

    let payload = MsgSetup::new(message.ring_size, &message.text).to_bytes();
    let size = u32::try_from(payload.len()).map_err(|_| ClientError::PayloadTooLarge(payload.len()))?;
    let msg = PortholeMsg {
        msg_type: message.msg_type,
        addr: payload.as_ptr() as u64,
        size,
    };

    let mut out = [0u8; MAP_ID_SIZE];
    request(client, "send message", IOCTL_PORTHOLE_SEND_MSG, &msg.to_bytes(), &mut out)?;
    let map_id = u32::from_le_bytes(out);

    let segments = sim
        .messages()
        .iter()
        .find(|sent| sent.id == map_id)
        .map_or(0, |sent| sent.segments.len());
    info!(map_id, segments, bytes = payload.len(), "buffer shared");

    request(client, "unlock buffer", IOCTL_PORTHOLE_UNLOCK_BUFFER, &map_id.to_le_bytes(), &mut [])?;

    info!("waiting for the peer to detach");
    if !platform.wait_event(disconnect, wait) {
        return Err(ClientError::EventTimeout("disconnect"));
    }

    Ok(SessionReport {
        map_id,
        segments,
        payload_len: payload.len(),
    })
}
