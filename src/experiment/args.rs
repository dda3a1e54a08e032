//! Argument merging and inter-flag dependency resolution.
//!
//! Encoder arguments are `--Key=Value` tokens. Lists are merged last-wins by
//! key, then [`apply_dependencies`] adds flags implied by the merged set.

use crate::error::{Error, Result};

/// Quantization toggles whose state implies the dependent-quantization flag.
const RDOQ_KEYS: &[&str] = &["RDOQ", "RDOQTS"];

/// Flag implied by the RDOQ toggles.
const DEP_QUANT_KEY: &str = "DepQuant";

/// Split a `--Key=Value` token into `(key, value)`.
///
/// # Example
///
/// ```
/// use codec_ablate::experiment::args::parse_arg;
///
/// assert_eq!(parse_arg("--ALF=0").unwrap(), ("ALF", "0"));
/// assert!(parse_arg("ALF=0").is_err());
/// ```
pub fn parse_arg(token: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| Error::InvalidArgument {
        token: token.to_string(),
        reason: reason.to_string(),
    };

    let body = token
        .trim()
        .strip_prefix("--")
        .ok_or_else(|| invalid("expected a leading `--`"))?;
    let (key, value) = body
        .split_once('=')
        .ok_or_else(|| invalid("expected `--Key=Value`"))?;
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid("key contains unsupported characters"));
    }
    Ok((key, value))
}

/// Flip a boolean `--Key=0` / `--Key=1` toggle.
///
/// Returns `None` for malformed tokens and non-boolean values.
///
/// ```
/// use codec_ablate::experiment::args::invert_toggle;
///
/// assert_eq!(invert_toggle("--SAO=0").as_deref(), Some("--SAO=1"));
/// assert_eq!(invert_toggle("--MaxMTTHierarchyDepth=2"), None);
/// ```
#[must_use]
pub fn invert_toggle(token: &str) -> Option<String> {
    let (key, value) = parse_arg(token).ok()?;
    let flipped = match value {
        "0" => "1",
        "1" => "0",
        _ => return None,
    };
    Some(format!("--{key}={flipped}"))
}

/// Merge a base list with override lists and resolve dependent flags.
///
/// Blank tokens are dropped. When a key repeats, the later token wins and
/// takes the later position.
///
/// # Example
///
/// ```
/// use codec_ablate::experiment::args::merge_args;
///
/// let base = vec!["--SAO=1".to_string(), "--ALF=1".to_string()];
/// let tool = vec!["--ALF=0".to_string()];
/// let merged = merge_args(&base, &[tool.as_slice()]).unwrap();
/// assert_eq!(merged, vec!["--SAO=1", "--ALF=0"]);
/// ```
pub fn merge_args(base: &[String], overrides: &[&[String]]) -> Result<Vec<String>> {
    let mut merged: Vec<(String, String)> = Vec::new();

    for token in base.iter().chain(overrides.iter().flat_map(|list| list.iter())) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, _) = parse_arg(token)?;
        merged.retain(|(k, _)| k != key);
        merged.push((key.to_string(), token.to_string()));
    }

    let tokens = merged.into_iter().map(|(_, token)| token).collect();
    Ok(apply_dependencies(tokens))
}

/// Add the dependent-quantization flag implied by the RDOQ toggles.
///
/// If any RDOQ toggle is off and none is on, existing `--DepQuant=` tokens are
/// replaced by `--DepQuant=0`; symmetrically for on. Mixed or absent toggles
/// leave the list unchanged. Applying the rule twice gives the same list.
///
/// # Example
///
/// ```
/// use codec_ablate::experiment::args::apply_dependencies;
///
/// let args = vec!["--RDOQ=0".to_string(), "--DepQuant=1".to_string()];
/// let resolved = apply_dependencies(args);
/// assert_eq!(resolved, vec!["--RDOQ=0", "--DepQuant=0"]);
/// assert_eq!(apply_dependencies(resolved.clone()), resolved);
/// ```
#[must_use]
pub fn apply_dependencies(args: Vec<String>) -> Vec<String> {
    let mut any_off = false;
    let mut any_on = false;
    for token in &args {
        if let Ok((key, value)) = parse_arg(token) {
            if RDOQ_KEYS.contains(&key) {
                match value {
                    "0" => any_off = true,
                    "1" => any_on = true,
                    _ => {}
                }
            }
        }
    }

    let implied = match (any_off, any_on) {
        (true, false) => "0",
        (false, true) => "1",
        _ => return args,
    };

    let mut resolved: Vec<String> = args
        .into_iter()
        .filter(|token| parse_arg(token).map_or(true, |(key, _)| key != DEP_QUANT_KEY))
        .collect();
    resolved.push(format!("--{DEP_QUANT_KEY}={implied}"));
    resolved
}
