//! Placeholder formatting.
//!
//! `{name}` is replaced by the variable's value, `{{` and `}}` are literal
//! braces. When the result still contains `%`, it is passed through
//! `strftime` against local time so `{revision}-%Y%m%d` works as expected.

use anyhow::Result;
use chrono::format::{Item, StrftimeItems};
use chrono::Local;

use super::Variables;
use crate::error::NimpError;

/// Expand `template` against `vars`. Unknown placeholders are errors.
pub fn format(template: &str, vars: &Variables) -> Result<String> {
    let expanded = expand_placeholders(template, vars)?;
    if expanded.contains('%') {
        return strftime(&expanded);
    }
    Ok(expanded)
}

fn expand_placeholders(template: &str, vars: &Variables) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => name.push(inner),
                        None => {
                            return Err(NimpError::config(format!(
                                "Unterminated placeholder in \"{}\"",
                                template
                            ))
                            .into())
                        }
                    }
                }
                match vars.get(name.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(NimpError::config(format!(
                            "Unknown placeholder {{{}}} in \"{}\"",
                            name, template
                        ))
                        .into())
                    }
                }
            }
            '}' => {
                return Err(
                    NimpError::config(format!("Single '}}' in \"{}\"", template)).into(),
                )
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn strftime(text: &str) -> Result<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(text).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(NimpError::config(format!("Invalid date directive in \"{}\"", text)).into());
    }
    Ok(Local::now().format_with_items(items.into_iter()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        let mut vars = Variables::default();
        vars.set("uproject", "Game");
        vars.set("platform", "win64");
        vars
    }

    #[test]
    fn test_simple_placeholders() {
        assert_eq!(
            format("{uproject}/Binaries/{platform}", &vars()).unwrap(),
            "Game/Binaries/win64"
        );
    }

    #[test]
    fn test_brace_escapes() {
        assert_eq!(format("{{literal}} {uproject}", &vars()).unwrap(), "{literal} Game");
    }

    #[test]
    fn test_unknown_placeholder_is_config_error() {
        let err = format("{missing}", &vars()).unwrap_err();
        assert!(matches!(err.downcast_ref::<NimpError>(), Some(NimpError::Config(_))));
    }

    #[test]
    fn test_strftime_applied_after_placeholders() {
        let out = format("{uproject}-%Y", &vars()).unwrap();
        let year = Local::now().format("%Y").to_string();
        assert_eq!(out, format!("Game-{}", year));
    }

    #[test]
    fn test_no_percent_is_untouched() {
        assert_eq!(format("plain", &vars()).unwrap(), "plain");
    }
}
