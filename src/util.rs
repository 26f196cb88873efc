//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to the user's home directory.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
///
/// Falls back to `USERPROFILE` so the default binary path also works on
/// Windows hosts.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"));
        if let Ok(home) = home {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// First 8 characters of an id, for log lines.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
