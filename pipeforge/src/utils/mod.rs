//! Identifier and timestamp helpers.

mod timestamps;

pub use timestamps::{from_micros, iso_timestamp, now_utc, to_micros, Timestamp};

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered). Execution ids use this so that
/// rows inserted later sort later in the durable store.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_valid() {
        assert_eq!(generate_uuid().get_version_num(), 4);
        assert_eq!(generate_uuid_v7().get_version_num(), 7);
    }

    #[test]
    fn test_uuid_v7_is_time_ordered() {
        let a = generate_uuid_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate_uuid_v7();
        assert!(a < b);
    }
}
