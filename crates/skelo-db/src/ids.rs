//! ULID allocation.
//!
//! All primary keys are 26-character Crockford base32 ULIDs. The timestamp
//! prefix makes lexicographic order equal creation order, which the queue
//! and the audit log both rely on as the final tiebreaker. A shared
//! monotonic generator keeps ids strictly increasing even within one
//! millisecond, so audit entries always sort in append order.

use std::sync::{Mutex, OnceLock};

use ulid::{Generator, Ulid};

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Allocate a fresh ULID string, strictly greater than any previously
/// allocated in this process.
pub fn new_id() -> String {
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut generator = generator.lock().unwrap_or_else(|e| e.into_inner());
    match generator.generate() {
        Ok(id) => id.to_string(),
        // The random component overflowed within one millisecond; a fresh
        // ULID is still time-ordered relative to earlier milliseconds.
        Err(_) => Ulid::new().to_string(),
    }
}

/// Check whether a string parses as a ULID.
pub fn is_valid(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}
