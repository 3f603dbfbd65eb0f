//! The Event Bus: a bounded, ordered, single-producer/single-consumer
//! channel from the blocking Device Reader thread into the async runtime.
//!
//! No coalescing happens here: back-pressure is the reader's problem
//! (`device::run_device_reader` blocks on a full channel), not the bus's.

use tokio::sync::mpsc;

use crate::device::DeviceEvent;

pub const CAPACITY: usize = 16;

pub fn channel() -> (mpsc::Sender<DeviceEvent>, mpsc::Receiver<DeviceEvent>) {
    mpsc::channel(CAPACITY)
}
