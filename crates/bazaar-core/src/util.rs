/// Lowercase, hyphen-joined, ASCII-only form of a display name. Runs of
/// anything that is not `[a-z0-9]` collapse into a single hyphen.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut gap = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !out.is_empty() {
                out.push('-');
            }
            gap = false;
            out.push(c.to_ascii_lowercase());
        } else {
            gap = true;
        }
    }
    out
}

pub fn with_suffix(base: &str, n: u32) -> String {
    format!("{base}-{n}")
}
