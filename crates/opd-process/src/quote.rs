//! Quoting for values pasted into a platform shell command line.

use std::borrow::Cow;
use std::path::Path;

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_-.,/:=@%+".contains(c)
}

/// `arg` as one shell word. Plain words are returned untouched.
#[cfg(not(windows))]
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(is_plain) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}

/// `arg` as one `cmd.exe` word. Plain words are returned untouched.
#[cfg(windows)]
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(|c| is_plain(c) || c == '\\') {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("\"{}\"", arg.replace('"', "\"\"")))
}

pub fn quote_path(path: &Path) -> String {
    quote_arg(&path.to_string_lossy()).into_owned()
}
