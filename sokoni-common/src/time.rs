//! Unix-millis helpers for external references and event metadata.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch as an [`i64`].
///
/// Panics only if the system clock is set before 1970.
pub fn now_ms() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis();
    i64::try_from(millis).expect("system clock unreasonably far in the future")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_ms_is_after_2023() {
        assert!(now_ms() > 1_672_531_200_000);
    }
}
