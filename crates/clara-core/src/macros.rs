//! `${name}` macro expansion for command templates.
//!
//! Macros are a flat map of name to replacement text. A macro value may
//! reference other macros; cycles are rejected at resolution time. The
//! `${PORT}` placeholder is reserved for the runtime and survives expansion
//! untouched.

use std::collections::BTreeMap;

use crate::error::ConfigError;

/// Placeholder substituted by the runtime at spawn time.
pub const PORT_PLACEHOLDER: &str = "PORT";

/// Resolve a macro map so that no value references another macro.
///
/// # Errors
///
/// Returns `ConfigError::MacroCycle` when a macro reaches itself through
/// any chain of references, and `ConfigError::UnknownMacro` when a value
/// names a macro that does not exist.
pub fn resolve_macros(
    macros: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = BTreeMap::new();
    for name in macros.keys() {
        let mut chain = Vec::new();
        let value = resolve_one(name, macros, &mut chain)?;
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn resolve_one(
    name: &str,
    macros: &BTreeMap<String, String>,
    chain: &mut Vec<String>,
) -> Result<String, ConfigError> {
    if chain.iter().any(|seen| seen == name) {
        chain.push(name.to_string());
        return Err(ConfigError::MacroCycle(chain.join(" -> ")));
    }
    chain.push(name.to_string());

    let raw = macros
        .get(name)
        .ok_or_else(|| ConfigError::UnknownMacro {
            name: name.to_string(),
            context: format!("macro {}", chain.first().map_or("?", String::as_str)),
        })?;

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw.as_str();
    while let Some((literal, placeholder, tail)) = next_placeholder(rest) {
        out.push_str(literal);
        if placeholder == PORT_PLACEHOLDER {
            out.push_str("${PORT}");
        } else {
            out.push_str(&resolve_one(placeholder, macros, chain)?);
        }
        rest = tail;
    }
    out.push_str(rest);

    chain.pop();
    Ok(out)
}

/// Expand every `${name}` in `template` from `resolved`, leaving `${PORT}`
/// in place for the runtime.
///
/// # Errors
///
/// Returns `ConfigError::UnknownMacro` for placeholders that are neither
/// `PORT` nor a resolved macro. `context` names the template for the error
/// message.
pub fn expand_template(
    template: &str,
    resolved: &BTreeMap<String, String>,
    context: &str,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((literal, placeholder, tail)) = next_placeholder(rest) {
        out.push_str(literal);
        if placeholder == PORT_PLACEHOLDER {
            out.push_str("${PORT}");
        } else {
            match resolved.get(placeholder) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(ConfigError::UnknownMacro {
                        name: placeholder.to_string(),
                        context: context.to_string(),
                    });
                }
            }
        }
        rest = tail;
    }
    out.push_str(rest);
    Ok(out)
}

/// Split `input` at the first `${name}` placeholder.
///
/// Returns the literal prefix, the placeholder name, and the remainder.
/// `None` when no placeholder remains. A `${` without a closing brace is
/// treated as literal text.
fn next_placeholder(input: &str) -> Option<(&str, &str, &str)> {
    let start = input.find("${")?;
    let after = &input[start + 2..];
    let end = after.find('}')?;
    Some((&input[..start], &after[..end], &after[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn resolves_nested_macros() {
        let macros = map(&[
            ("base", "--ctx 4096"),
            ("gpu", "${base} --n-gpu-layers 99"),
        ]);
        let resolved = resolve_macros(&macros).unwrap();
        assert_eq!(resolved["gpu"], "--ctx 4096 --n-gpu-layers 99");
    }

    #[test]
    fn rejects_macro_cycle() {
        let macros = map(&[("a", "${b}"), ("b", "${a}")]);
        let err = resolve_macros(&macros).unwrap_err();
        assert!(matches!(err, ConfigError::MacroCycle(_)));
    }

    #[test]
    fn rejects_self_reference() {
        let macros = map(&[("a", "x ${a}")]);
        assert!(matches!(
            resolve_macros(&macros),
            Err(ConfigError::MacroCycle(_))
        ));
    }

    #[test]
    fn port_survives_expansion() {
        let resolved = resolve_macros(&map(&[("flags", "-v")])).unwrap();
        let out = expand_template(
            "server --port ${PORT} ${flags}",
            &resolved,
            "model m1 cmdTemplate",
        )
        .unwrap();
        assert_eq!(out, "server --port ${PORT} -v");
    }

    #[test]
    fn unknown_macro_is_an_error() {
        let resolved = BTreeMap::new();
        let err = expand_template("x ${missing}", &resolved, "model m1 cmdTemplate").unwrap_err();
        match err {
            ConfigError::UnknownMacro { name, .. } => assert_eq!(name, "missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let resolved = BTreeMap::new();
        let out = expand_template("echo ${", &resolved, "t").unwrap();
        assert_eq!(out, "echo ${");
    }
}
