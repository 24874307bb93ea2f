//! Input sanitation at the two places untrusted data enters the runtime.
//!
//! - Hook source: byte sequences that were decoded with the wrong charset
//!   (UTF-8 read as Windows-1252) are replaced with the characters they
//!   were meant to be. Left alone they reliably break compilation.
//! - Hook params: keys like `__proto__` that could be used to pollute
//!   `Object.prototype` inside the isolate are refused.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// Maximum number of entries in a params mapping
const MAX_PARAMS: usize = 256;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Mis-decoded sequences and their intended text. Longer sequences first.
const MOJIBAKE: &[(&str, &str)] = &[
    ("\u{00ef}\u{00bb}\u{00bf}", ""),
    ("\u{00e2}\u{20ac}\u{0153}", "\u{201c}"),
    ("\u{00e2}\u{20ac}\u{009d}", "\u{201d}"),
    ("\u{00e2}\u{20ac}\u{02dc}", "\u{2018}"),
    ("\u{00e2}\u{20ac}\u{2122}", "\u{2019}"),
    ("\u{00e2}\u{20ac}\u{201c}", "\u{2013}"),
    ("\u{00e2}\u{20ac}\u{201d}", "\u{2014}"),
    ("\u{00e2}\u{20ac}\u{00a6}", "\u{2026}"),
    ("\u{00c2}\u{00a0}", "\u{00a0}"),
];

/// Replace known mis-decoded sequences in hook source.
pub fn fix_mojibake(source: &str) -> String {
    if !source.contains(['\u{00e2}', '\u{00c2}', '\u{00ef}']) {
        return source.to_string();
    }
    MOJIBAKE
        .iter()
        .fold(source.to_string(), |text, (garbled, fixed)| {
            text.replace(garbled, fixed)
        })
}

/// Validate a flat params mapping before it is handed to a hook.
///
/// # Errors
/// Returns an error if:
/// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
/// - There are more than MAX_PARAMS (256) entries
pub fn sanitize_params(params: &BTreeMap<String, String>) -> Result<()> {
    if params.len() > MAX_PARAMS {
        return Err(anyhow!(
            "Too many params ({}, max {})",
            params.len(),
            MAX_PARAMS
        ));
    }

    for key in params.keys() {
        if DANGEROUS_KEYS.contains(&key.as_str()) {
            return Err(anyhow!(
                "Prototype pollution attempt: '{}' key is forbidden in params",
                key
            ));
        }
    }

    Ok(())
}
