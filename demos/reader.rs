//! Consumer half of the two-process demo.
//!
//! Waits for the writer's rendezvous region, parses the
//! `(region name, offset)` descriptor, maps the message region through
//! a [`ReaderCache`], and prints the message.
//!
//! Run `cargo run --example writer` first, then this program.

use ipcator::name::SHM_NAME_LEN;
use ipcator::{ReaderCache, Region};
use std::time::Duration;

const DESCRIPTOR_NAME: &str = "/ipcator-demo-descriptor";
const ACK_NAME: &str = "/ipcator-demo-ack";

fn main() -> ipcator::Result<()> {
    tracing_subscriber::fmt::init();

    let descriptor = Region::open_with_retry(DESCRIPTOR_NAME, false, Duration::from_secs(30))?;
    let bytes = descriptor.bytes();
    let name_len = bytes[..SHM_NAME_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(SHM_NAME_LEN);
    let name = std::str::from_utf8(&bytes[..name_len]).expect("region name is ASCII");
    let offset_bytes: [u8; 8] = bytes[SHM_NAME_LEN..SHM_NAME_LEN + 8]
        .try_into()
        .expect("descriptor holds an 8-byte offset");
    let offset = u64::from_le_bytes(offset_bytes) as usize;

    let mut cache = ReaderCache::new();
    let region = cache.select(name)?;
    let payload = &region.bytes()[offset..];
    let text_len = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    println!(
        "read from {name} at offset {offset}: {}",
        String::from_utf8_lossy(&payload[..text_len])
    );

    // Acknowledge, give the writer a moment to observe the marker, exit.
    let _ack = Region::create(ACK_NAME, 1)?;
    std::thread::sleep(Duration::from_millis(200));
    Ok(())
}
