//! Status code validation tests

use libporthole::Status;

const ALL_ERRORS: [Status; 11] = [
    Status::InvalidArgument,
    Status::ResourceExhausted,
    Status::AccessViolation,
    Status::NotConnected,
    Status::Timeout,
    Status::BadAddress,
    Status::DeviceError,
    Status::InvalidHandle,
    Status::NotFound,
    Status::InvalidRequest,
    Status::HardwareError,
];

#[test]
fn test_success_is_zero() {
    assert_eq!(Status::Success.as_raw(), 0);
    assert_eq!(Status::from_raw(0), Some(Status::Success));
    assert_eq!(Status::Success.into_result(), Ok(()));
    assert!(Status::Success.is_success());
}

#[test]
fn test_errors_are_negative_and_round_trip() {
    for status in ALL_ERRORS {
        assert!(status.as_raw() < 0, "{:?} must be negative", status);
        assert_eq!(Status::from_raw(status.as_raw()), Some(status));
        assert_eq!(status.into_result(), Err(status));
    }
}

#[test]
fn test_unknown_values_are_not_mapped() {
    for value in [1, 5, i32::MAX, -12, -100, i32::MIN] {
        assert_eq!(Status::from_raw(value), None, "{} must stay unknown", value);
    }
}

#[test]
fn test_error_values_are_unique() {
    for (i, a) in ALL_ERRORS.iter().enumerate() {
        for b in &ALL_ERRORS[i + 1..] {
            assert_ne!(a.as_raw(), b.as_raw());
        }
    }
}

#[test]
fn test_display_is_lowercase_phrase() {
    assert_eq!(Status::NotConnected.to_string(), "device not connected");
    assert_eq!(Status::NotFound.to_string(), "mapping not found");
}
