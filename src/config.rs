//! MAK lookup for the bundled demos.
//!
//! The decoder core never reads configuration; callers pass the MAK to
//! [`decode`](crate::decode) explicitly. The demos resolve it once at
//! startup: the `TIVODEC_MAK` environment variable wins, falling back to
//! a `mak = "..."` line in a `config.toml` in the working directory.
//! When neither names a key the demos refuse to run rather than decrypt
//! with a bogus default.

use std::env;
use std::fs;

const MAK_ENV_VAR: &str = "TIVODEC_MAK";
const CONFIG_FILE: &str = "config.toml";

/// Resolves the demo MAK, environment first, then `config.toml`.
pub fn resolve_mak() -> Option<String> {
    if let Ok(mak) = env::var(MAK_ENV_VAR) {
        let mak = mak.trim();
        if !mak.is_empty() {
            return Some(mak.to_string());
        }
    }
    mak_from_toml(&fs::read_to_string(CONFIG_FILE).ok()?)
}

/// Pulls the `mak` value out of a flat `key = "value"` config body.
fn mak_from_toml(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() != "mak" {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}
