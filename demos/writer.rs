//! Producer half of the two-process demo.
//!
//! Bump-allocates a message in shared memory and publishes its
//! `(region name, offset)` descriptor through a well-known rendezvous
//! region, then waits for the reader to acknowledge.
//!
//! Run `cargo run --example writer` in one terminal, then
//! `cargo run --example reader` in another.

use ipcator::name::SHM_NAME_LEN;
use ipcator::{MonotonicBuffer, Region, ShmResource};
use std::time::Duration;

const DESCRIPTOR_NAME: &str = "/ipcator-demo-descriptor";
const ACK_NAME: &str = "/ipcator-demo-ack";
const MESSAGE: &str = "Hello from the ipcator writer!";

fn main() -> ipcator::Result<()> {
    tracing_subscriber::fmt::init();

    let mut buf = MonotonicBuffer::default();
    let ptr = buf.allocate(MESSAGE.len() + 1, 1)?;
    // SAFETY: MESSAGE.len() + 1 bytes were just allocated at ptr.
    unsafe {
        std::ptr::copy_nonoverlapping(MESSAGE.as_ptr(), ptr.as_ptr(), MESSAGE.len());
        *ptr.as_ptr().add(MESSAGE.len()) = 0;
    }
    let region = buf
        .upstream()
        .last_inserted()
        .expect("allocate created a region");
    let offset = ptr.as_ptr() as usize - region.as_ptr() as usize;

    // The descriptor layout is the full name (NUL-padded to 248 bytes)
    // followed by a little-endian u64 offset.
    let mut descriptor = Region::create(DESCRIPTOR_NAME, SHM_NAME_LEN + 8)?;
    let bytes = descriptor.bytes_mut().expect("creator mapping is writable");
    bytes[..region.name().len()].copy_from_slice(region.name().as_bytes());
    bytes[SHM_NAME_LEN..].copy_from_slice(&(offset as u64).to_le_bytes());

    println!(
        "published {} message bytes at offset {offset} of {}",
        MESSAGE.len(),
        region.name()
    );
    println!("waiting for the reader...");
    Region::open_with_retry(ACK_NAME, false, Duration::from_secs(30))?;
    println!("reader acknowledged, shutting down");
    Ok(())
}
