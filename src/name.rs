//! Globally-unique shared memory object names.
//!
//! A region name is the POSIX shm path handed to `shm_open`: it starts
//! with `/`, contains no other `/`, and materializes under `/dev/shm`.
//! [`gen_name`] produces names of a fixed length chosen so that the full
//! `/dev/shm` path stays within the 255-character filename limit.
//!
//! Uniqueness comes from two layers: a process-wide counter gives every
//! name from one process a distinct, human-orderable sequence number, and
//! a long random suffix makes collisions across processes astronomically
//! unlikely. Name generation and `shm_open` are not atomic, so the
//! coarse allocator still handles the residual collision by retrying
//! with a fresh name.

use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

use crate::error::{Error, Result};

/// Total length of a generated name, including the leading `/`.
///
/// `/dev/shm` plus the 247-character filename component stays within the
/// POSIX 255-character limit, and the name plus an 8-byte offset fits in
/// 256 bytes.
pub const SHM_NAME_LEN: usize = 248;

const NAME_PREFIX: &str = "/ipcator";

/// Process-wide sequence number; relaxed ordering is enough because the
/// random suffix carries the uniqueness guarantee.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// PRNG for name suffixes, seeded once per process from OS entropy.
static SUFFIX_RNG: LazyLock<Mutex<SmallRng>> =
    LazyLock::new(|| Mutex::new(SmallRng::from_os_rng()));

/// Generate a fresh, globally-unique shm object name.
///
/// The result is exactly [`SHM_NAME_LEN`] characters: the fixed prefix,
/// a zero-padded sequence number, and `[0-9A-Za-z]` random padding.
///
/// # Example
///
/// ```
/// use ipcator::name::{gen_name, SHM_NAME_LEN};
///
/// let name = gen_name();
/// assert_eq!(name.len(), SHM_NAME_LEN);
/// assert!(name.starts_with('/'));
/// assert_ne!(name, gen_name());
/// ```
pub fn gen_name() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{NAME_PREFIX}-{seq:06}-");

    let mut rng = SUFFIX_RNG.lock().unwrap_or_else(|err| err.into_inner());
    while name.len() < SHM_NAME_LEN {
        name.push(rng.sample(Alphanumeric) as char);
    }
    name
}

/// Check that `name` is a well-formed shm object name.
///
/// Rules: leading `/`, no other `/`, characters from `[A-Za-z0-9._-]`,
/// and short enough that the `/dev/shm` path fits the POSIX filename
/// limit.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() < 2 || name.len() > SHM_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "shm name must be 2..={SHM_NAME_LEN} characters, got {} in {name:?}",
            name.len()
        )));
    }
    if !name.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "shm name must start with '/': {name:?}"
        )));
    }
    let body = &name[1..];
    if let Some(bad) = body
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::InvalidArgument(format!(
            "shm name contains invalid character {bad:?}: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_name_length_and_prefix() {
        let name = gen_name();
        assert_eq!(name.len(), SHM_NAME_LEN);
        assert!(name.starts_with(NAME_PREFIX));
        // /dev/shm + filename component must fit a 255-char limit.
        assert!("/dev/shm".len() + (name.len() - 1) <= 255);
    }

    #[test]
    fn test_name_charset() {
        let name = gen_name();
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_names_are_unique() {
        let names: HashSet<String> = (0..1000).map(|_| gen_name()).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        // Sequence numbers sit between the first two '-' separators.
        let seq_of = |name: &str| -> u64 {
            name[NAME_PREFIX.len() + 1..]
                .split('-')
                .next()
                .unwrap()
                .parse()
                .unwrap()
        };
        let a = seq_of(&gen_name());
        let b = seq_of(&gen_name());
        assert!(b > a);
    }

    #[test]
    fn test_validate_rejects_malformed_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("/").is_err());
        assert!(validate_name("no-leading-slash").is_err());
        assert!(validate_name("/two/slashes").is_err());
        assert!(validate_name("/white space").is_err());
        let too_long = format!("/{}", "x".repeat(SHM_NAME_LEN));
        assert!(validate_name(&too_long).is_err());
        assert!(validate_name("/ok.name_0-9").is_ok());
    }
}
