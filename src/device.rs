//! Blocking reader for the spacenavd Unix-domain socket. Runs on a dedicated
//! native thread; see `bus.rs` for how samples cross into the async runtime.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::BridgeError;

pub const SPACENAV_SOCKET_PATH: &str = "/var/run/spnav.sock";
const RECORD_LEN: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub tx: i32,
    pub ty: i32,
    pub tz: i32,
    pub rx: i32,
    pub ry: i32,
    pub rz: i32,
    pub period_ms: i32,
    pub arrived_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButtonSample {
    pub index: i32,
    pub pressed: bool,
    pub arrived_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceEvent {
    Motion(MotionSample),
    Button(ButtonSample),
}

/// Decodes the eight little-endian int32 fields `(type, a, b, c, d, e, f, period)`.
///
/// The wire axis order is `x, z, y, pitch, yaw, roll` — this permutation
/// relative to the logical order must be preserved exactly; downstream
/// rotation math depends on it.
fn decode_record(record: &[u8; RECORD_LEN]) -> Option<DeviceEvent> {
    let mut fields = [0i32; 8];
    for (i, field) in fields.iter_mut().enumerate() {
        let start = i * 4;
        let bytes: [u8; 4] = record[start..start + 4].try_into().ok()?;
        *field = i32::from_le_bytes(bytes);
    }
    let [kind, a, b, c, d, e, f, period] = fields;
    let now = Instant::now();
    match kind {
        0 => Some(DeviceEvent::Motion(MotionSample {
            tx: a,
            tz: b,
            ty: c,
            rx: d,
            ry: e,
            rz: f,
            period_ms: period,
            arrived_at: now,
        })),
        1 | 2 => Some(DeviceEvent::Button(ButtonSample {
            index: a,
            pressed: kind == 1,
            arrived_at: now,
        })),
        _ => None,
    }
}

fn read_exact_record(stream: &mut UnixStream) -> std::io::Result<[u8; RECORD_LEN]> {
    let mut buf = [0u8; RECORD_LEN];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Blocking connect-decode-forward loop. Intended to be run via
/// `std::thread::spawn`. Applies back-pressure by blocking on
/// `blocking_send` when the bounded bus is full, per the spec's "discard
/// stale motion only when explicitly configured, by default block" policy.
pub fn run_device_reader(socket_path: &str, sender: mpsc::Sender<DeviceEvent>) {
    loop {
        let mut stream = match UnixStream::connect(socket_path) {
            Ok(stream) => {
                tracing::info!(socket_path, "connected to spatial device");
                stream
            }
            Err(err) => {
                let err = BridgeError::TransientDevice(err);
                tracing::info!(socket_path, error = %err, "spatial device unavailable, retrying");
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };

        loop {
            let record = match read_exact_record(&mut stream) {
                Ok(record) => record,
                Err(err) => {
                    let err = BridgeError::TransientDevice(err);
                    tracing::info!(error = %err, "spatial device stream error, reconnecting");
                    break;
                }
            };

            if let Some(event) = decode_record(&record) {
                if sender.blocking_send(event).is_err() {
                    tracing::info!("event bus closed, stopping device reader");
                    return;
                }
            }
        }

        std::thread::sleep(RECONNECT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: i32, a: i32, b: i32, c: i32, d: i32, e: i32, f: i32, period: i32) -> [u8; 32] {
        let mut buf = [0u8; 32];
        for (i, v) in [kind, a, b, c, d, e, f, period].into_iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn decodes_motion_with_axis_permutation() {
        let rec = record(0, 100, 2, 3, 4, 5, 6, 16);
        let event = decode_record(&rec).unwrap();
        match event {
            DeviceEvent::Motion(sample) => {
                assert_eq!(sample.tx, 100);
                assert_eq!(sample.tz, 2);
                assert_eq!(sample.ty, 3);
                assert_eq!(sample.rx, 4);
                assert_eq!(sample.ry, 5);
                assert_eq!(sample.rz, 6);
                assert_eq!(sample.period_ms, 16);
            }
            DeviceEvent::Button(_) => panic!("expected motion"),
        }
    }

    #[test]
    fn decodes_button_press_and_release() {
        match decode_record(&record(1, 3, 0, 0, 0, 0, 0, 0)).unwrap() {
            DeviceEvent::Button(sample) => {
                assert_eq!(sample.index, 3);
                assert!(sample.pressed);
            }
            DeviceEvent::Motion(_) => panic!("expected button"),
        }

        match decode_record(&record(2, 3, 0, 0, 0, 0, 0, 0)).unwrap() {
            DeviceEvent::Button(sample) => {
                assert_eq!(sample.index, 3);
                assert!(!sample.pressed);
            }
            DeviceEvent::Motion(_) => panic!("expected button"),
        }
    }

    #[test]
    fn drops_unknown_record_type() {
        assert!(decode_record(&record(9, 0, 0, 0, 0, 0, 0, 0)).is_none());
    }
}
