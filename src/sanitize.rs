/// Byte cap for log lines shipped by agents.
pub const MAX_LOG_BYTES: usize = 10_000;

/// Byte cap for user-originated strings persisted in rows (addresses,
/// error messages).
pub const MAX_FIELD_BYTES: usize = 5_000;

/// Strip control characters (C0, DEL, C1 — covers line breaks) from a
/// user-originated string and truncate to `max_bytes` on a char boundary.
/// Keeps logs single-line and storage bounded.
pub fn clean(input: &str, max_bytes: usize) -> String {
    let mut out: String = input.chars().filter(|c| !c.is_control()).collect();
    if out.len() > max_bytes {
        let mut end = max_bytes;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}
