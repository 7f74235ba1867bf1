//! Name slugging for run ids, step names, and artifact paths.

/// Collapse whitespace to single dashes and lowercase the result.
///
/// Produces names that are safe to embed in paths, job names, and cache
/// keys without further escaping.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;

    for ch in value.trim().chars() {
        if ch.is_whitespace() {
            pending_dash = !out.is_empty();
        } else {
            if pending_dash {
                out.push('-');
                pending_dash = false;
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }

    out
}
