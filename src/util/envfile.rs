use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn parse_env_content(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (idx, line) in content.lines().enumerate() {
        let s = line.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        if let Some(eq) = s.find('=') {
            let key = s[..eq].trim();
            let mut val = s[eq + 1..].trim().to_string();
            if val.len() >= 2
                && ((val.starts_with('"') && val.ends_with('"'))
                    || (val.starts_with('\'') && val.ends_with('\'')))
            {
                val = val[1..val.len() - 1].to_string();
            }
            map.insert(key.to_string(), val);
        } else {
            log::warn!("ignoring .env line {} without '=': {}", idx + 1, line);
        }
    }
    map
}

/// Parse a .env file. A missing file is an empty map.
pub fn parse_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(parse_env_content(&content))
}

/// Load `path` into the process environment without overriding variables
/// that are already set. Must run before any other thread is spawned.
pub fn load_env_file_from(path: &Path) -> Result<HashMap<String, String>> {
    let map = parse_env_file(path)?;
    for (k, v) in &map {
        if std::env::var_os(k).is_none() {
            unsafe {
                std::env::set_var(k, v);
            }
        }
    }
    Ok(map)
}

/// Load `.env` from the working directory, if present.
pub fn load_dotenv_if_present() -> Result<()> {
    load_env_file_from(Path::new(".env")).map(|_| ())
}
