use std::collections::BTreeMap;
use std::path::Path;

/// Parse `KEY=VALUE` lines. Blank lines, `#` comments and lines without a
/// key before `=` are skipped; matching single or double quotes are unwrapped.
pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq) = line.find('=') else { continue };
        if eq == 0 {
            continue;
        }
        let key = line[..eq].trim();
        let key = key.strip_prefix("export ").map(str::trim).unwrap_or(key);
        let value = unquote(line[eq + 1..].trim());
        out.insert(key.to_string(), value.to_string());
    }
    out
}

/// Read and parse a dotenv file. `None` if missing or unreadable.
pub fn read_dotenv(path: &Path) -> Option<BTreeMap<String, String>> {
    std::fs::read_to_string(path)
        .ok()
        .map(|content| parse_dotenv(&content))
}

fn unquote(v: &str) -> &str {
    let quoted = v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')));
    if quoted {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Keys whose values are meant to be public (bundled into client code).
pub fn is_public_key(key: &str) -> bool {
    key.starts_with("PUBLIC_") || key.starts_with("NEXT_PUBLIC_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_skips_noise() {
        let env = parse_dotenv(
            "# comment\n\nA=1\n=nokey\nnoeq\nB = \"quoted value\"\nC='single'\nexport D=exported\r\nE=a=b\n",
        );
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("quoted value"));
        assert_eq!(env.get("C").map(String::as_str), Some("single"));
        assert_eq!(env.get("D").map(String::as_str), Some("exported"));
        assert_eq!(env.get("E").map(String::as_str), Some("a=b"));
        assert_eq!(env.len(), 5);
    }

    #[test]
    fn lone_quote_is_kept() {
        let env = parse_dotenv("Q=\"\n");
        assert_eq!(env.get("Q").map(String::as_str), Some("\""));
    }

    #[test]
    fn public_prefixes() {
        assert!(is_public_key("NEXT_PUBLIC_API"));
        assert!(is_public_key("PUBLIC_URL"));
        assert!(!is_public_key("API_PUBLIC_KEY"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_dotenv(&dir.path().join(".env")).is_none());
    }
}
