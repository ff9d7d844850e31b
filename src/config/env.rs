// `${VAR}` / `${VAR:-default}` expansion for the raw config document, run
// once over the whole file before TOML parsing.

use std::sync::OnceLock;

use regex::Regex;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("static regex"))
}

/// Replace every `${VAR}` or `${VAR:-default}` occurrence in `input` with
/// the named environment variable, or the literal default when the
/// variable is unset (`${VAR:-default}`) or absent entirely (`${VAR}`
/// becomes the empty string, matching shell-style expansion).
pub fn expand_env_vars(input: &str) -> String {
    pattern()
        .replace_all(input, |caps: &regex::Captures| {
            let var = &caps[1];
            let default = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}
