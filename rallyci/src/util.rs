use std::time::Duration;

use rand::Rng;

/// Upper bound for [`backoff_delay`].
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Shell-escape a string by wrapping it in single quotes.
///
/// Single quotes inside the string are handled by ending the single-quoted
/// segment, inserting an escaped single quote, and starting a new segment:
/// `it's` becomes `'it'\''s'`.
pub(crate) fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Exponential backoff: `base * 2^attempt`, capped at [`MAX_BACKOFF`].
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    base.saturating_mul(multiplier).min(MAX_BACKOFF)
}

/// Random domain name, e.g. `rci_3f09a1c2b4d5e6f7`.
///
/// 64 random bits keep collisions between concurrently running daemons
/// negligible.
pub(crate) fn random_vm_name() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("rci_{:016x}", suffix)
}

/// Random locally-administered unicast MAC in the KVM `52:54:00` range.
pub(crate) fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
