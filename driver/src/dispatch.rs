//! Control-code dispatch
//!
//! Decodes the fixed-size request records of the client ABI, runs the
//! matching client operation and encodes the completion. Requests run to
//! completion on the calling thread; a handshake that has started is never
//! cancelled.

use crate::client::ClientContext;
use crate::error::DriverError;
use crate::mem::VirtAddr;
use crate::protocol::MapId;
use crate::traits::Platform;
use libporthole::{
    map_id_from_bytes, PortholeEvents, PortholeMsg, Status, IOCTL_PORTHOLE_REGISTER_EVENTS,
    IOCTL_PORTHOLE_SEND_MSG, IOCTL_PORTHOLE_UNLOCK_BUFFER, MAP_ID_SIZE,
};

/// Outcome of a dispatched request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Completion status
    pub status: Status,
    /// Bytes written to the output buffer
    pub information: usize,
}

impl Completion {
    fn success(information: usize) -> Self {
        Self { status: Status::Success, information }
    }

    fn failed(err: DriverError) -> Self {
        Self { status: err.into(), information: 0 }
    }
}

fn send_msg<P: Platform>(
    client: &ClientContext<P>,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, DriverError> {
    let msg = PortholeMsg::from_bytes(input).ok_or(DriverError::InvalidArgument)?;
    if output.len() != MAP_ID_SIZE {
        return Err(DriverError::InvalidArgument);
    }

    let id = client.send_message(msg.msg_type, VirtAddr::new(msg.addr), msg.size)?;
    output.copy_from_slice(&id.as_u32().to_le_bytes());
    Ok(MAP_ID_SIZE)
}

fn unlock_buffer<P: Platform>(client: &ClientContext<P>, input: &[u8]) -> Result<usize, DriverError> {
    let id = map_id_from_bytes(input).ok_or(DriverError::InvalidArgument)?;
    client.unlock_buffer(MapId(id))?;
    Ok(0)
}

fn register_events<P: Platform>(client: &ClientContext<P>, input: &[u8]) -> Result<usize, DriverError> {
    let events = PortholeEvents::from_bytes(input).ok_or(DriverError::InvalidArgument)?;
    client.register_events(events.connect_handle(), events.disconnect_handle())?;
    Ok(0)
}

/// Run one control request for `client`
///
/// A `NotConnected` result from any operation means the device has already
/// dropped every mapping, so the client's table is released with it.
pub fn dispatch<P: Platform>(
    client: &ClientContext<P>,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Completion {
    let result = match code {
        IOCTL_PORTHOLE_SEND_MSG => send_msg(client, input, output),
        IOCTL_PORTHOLE_UNLOCK_BUFFER => unlock_buffer(client, input),
        IOCTL_PORTHOLE_REGISTER_EVENTS => register_events(client, input),
        _ => {
            log::debug!("Unknown control code {:#x} from client {}", code, client.id());
            Err(DriverError::InvalidRequest)
        }
    };

    match result {
        Ok(information) => Completion::success(information),
        Err(DriverError::NotConnected) => {
            client.release_mappings();
            Completion::failed(DriverError::NotConnected)
        }
        Err(err) => Completion::failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DriverConfig};
    use crate::traits::mock::MockPlatform;
    use alloc::sync::Arc;
    use libporthole::NO_HANDLE;

    const P: u64 = 0x80_0000;

    fn device() -> Arc<Device<MockPlatform>> {
        let platform = MockPlatform::new();
        let regs = platform.registers().clone();
        Arc::new(Device::new(platform, regs, 3, DriverConfig::default()))
    }

    fn send(client: &ClientContext<MockPlatform>, addr: u64, size: u32) -> (Completion, u32) {
        let msg = PortholeMsg { msg_type: 1, addr, size };
        let mut out = [0u8; MAP_ID_SIZE];
        let completion = dispatch(client, IOCTL_PORTHOLE_SEND_MSG, &msg.to_bytes(), &mut out);
        (completion, u32::from_le_bytes(out))
    }

    #[test]
    fn test_send_and_unlock() {
        let device = device();
        let client = device.open_client();

        let (completion, id) = send(&client, P, 4096);
        assert_eq!(completion, Completion { status: Status::Success, information: MAP_ID_SIZE });
        assert_eq!(client.active_mappings(), 1);

        let completion = dispatch(&client, IOCTL_PORTHOLE_UNLOCK_BUFFER, &id.to_le_bytes(), &mut []);
        assert_eq!(completion.status, Status::Success);
        assert_eq!(completion.information, 0);

        let completion = dispatch(&client, IOCTL_PORTHOLE_UNLOCK_BUFFER, &id.to_le_bytes(), &mut []);
        assert_eq!(completion.status, Status::NotFound);
    }

    #[test]
    fn test_buffer_sizes_checked() {
        let device = device();
        let client = device.open_client();
        let msg = PortholeMsg { msg_type: 1, addr: P, size: 4096 }.to_bytes();

        let short_out = dispatch(&client, IOCTL_PORTHOLE_SEND_MSG, &msg, &mut [0u8; 2]);
        assert_eq!(short_out.status, Status::InvalidArgument);

        let short_in = dispatch(&client, IOCTL_PORTHOLE_SEND_MSG, &msg[..16], &mut [0u8; 4]);
        assert_eq!(short_in.status, Status::InvalidArgument);

        let unlock = dispatch(&client, IOCTL_PORTHOLE_UNLOCK_BUFFER, &[0u8; 8], &mut []);
        assert_eq!(unlock.status, Status::InvalidArgument);

        let events = dispatch(&client, IOCTL_PORTHOLE_REGISTER_EVENTS, &[0u8; 8], &mut []);
        assert_eq!(events.status, Status::InvalidArgument);

        assert!(device.platform().registers().commands().is_empty());
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = device();
        let client = device.open_client();

        let (completion, _) = send(&client, P, 0);
        assert_eq!(completion.status, Status::InvalidArgument);
        let (completion, _) = send(&client, 0, 4096);
        assert_eq!(completion.status, Status::InvalidArgument);
    }

    #[test]
    fn test_unknown_code() {
        let device = device();
        let client = device.open_client();

        let completion = dispatch(&client, 0x0022_2FFC, &[], &mut []);
        assert_eq!(completion.status, Status::InvalidRequest);
    }

    #[test]
    fn test_register_events_sentinel() {
        let device = device();
        let client = device.open_client();
        let down = device.platform().create_event();

        let request = PortholeEvents { connect: NO_HANDLE, disconnect: down }.to_bytes();
        let completion = dispatch(&client, IOCTL_PORTHOLE_REGISTER_EVENTS, &request, &mut []);
        assert_eq!(completion.status, Status::Success);
        assert_eq!(device.registration_count(), 1);

        let bad = PortholeEvents { connect: 0x1234_5678, disconnect: NO_HANDLE }.to_bytes();
        let completion = dispatch(&client, IOCTL_PORTHOLE_REGISTER_EVENTS, &bad, &mut []);
        assert_eq!(completion.status, Status::InvalidHandle);
        assert_eq!(device.registration_count(), 1);
    }

    #[test]
    fn test_not_connected_releases_mappings() {
        let device = device();
        let client = device.open_client();
        let down = device.platform().create_event();
        client.register_events(None, Some(down)).unwrap();

        send(&client, P, 4096);
        send(&client, P + 0x10000, 4096);
        assert_eq!(client.active_mappings(), 2);

        device.platform().registers().set_connected(false);
        let (completion, _) = send(&client, P + 0x20000, 4096);

        assert_eq!(completion.status, Status::NotConnected);
        assert_eq!(client.active_mappings(), 0);
        assert_eq!(device.platform().outstanding_locks(), 0);
        // Registrations survive so the client still hears about the reconnect
        assert_eq!(device.registration_count(), 1);
    }
}
