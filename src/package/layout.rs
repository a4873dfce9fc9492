//! Layout and manifest templating.
//!
//! Layout files (`.gp4`, `.gp5`, `.xml`) and manifests are staged once per
//! configuration and region. `{placeholders}` are substituted, Shipping
//! drops `<!-- #if Debug -->` blocks and PS4 region blocks are filtered.

use anyhow::{bail, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;

use crate::error::NimpError;

const SCE_REGIONS: [&str; 3] = ["SCEE", "SCEA", "SCEJ"];

/// `<project>` for Development, `<project>-<platform>-<configuration>`
/// otherwise.
pub fn executable_name(project: &str, platform: &str, configuration: &str) -> String {
    if configuration == "Development" {
        project.to_string()
    } else {
        format!("{}-{}-{}", project, platform, configuration)
    }
}

/// Apply `parameters` to a layout or manifest template.
pub fn transform(content: &str, parameters: &BTreeMap<String, String>) -> Result<String> {
    let mut content = substitute(content, parameters)?;

    let shipping = parameters
        .get("configuration")
        .is_some_and(|c| c.eq_ignore_ascii_case("shipping"));
    if shipping {
        let debug = Regex::new(r"(?s)<!-- #if Debug -->.*?<!-- #endif Debug -->")?;
        content = debug.replace_all(&content, "").into_owned();
    }

    if let Some(region) = parameters.get("region") {
        content = filter_regions(&content, region)?;
    }
    Ok(content)
}

/// `{name}` substitution with `{{`/`}}` escapes; unknown names are an error.
fn substitute(content: &str, parameters: &BTreeMap<String, String>) -> Result<String> {
    let pattern = Regex::new(r"\{\{|\}\}|\{(\w+)\}")?;
    let mut missing = None;
    let result = pattern.replace_all(content, |caps: &Captures| match caps.get(1) {
        Some(name) => match parameters.get(name.as_str()) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.as_str().to_string());
                String::new()
            }
        },
        None => caps[0][..1].to_string(),
    });
    if let Some(name) = missing {
        bail!(NimpError::config(format!("Unknown layout placeholder {{{}}}", name)));
    }
    Ok(result.into_owned())
}

/// Keep the blocks whose marker lists `region` (dropping the markers) and
/// remove the blocks of every other SCE region.
///
/// ```text
/// <!-- #if SCEA,SCEJ -->
/// <file targ_path="..."/>
/// <!-- #endif SCEA,SCEJ -->
/// ```
fn filter_regions(content: &str, region: &str) -> Result<String> {
    let current_letter = region.chars().last().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
    let others: String = SCE_REGIONS
        .iter()
        .filter_map(|r| r.chars().last())
        .filter(|letter| *letter != current_letter)
        .collect();
    let other = format!("SCE[{}]", others);

    let mut content = content.to_string();
    for candidate in SCE_REGIONS {
        let list = format!("(?:{other},)*{candidate}(?:,{other})*", other = other, candidate = candidate);
        let pattern = if candidate.eq_ignore_ascii_case(region) {
            format!(r"(?s)\s*<!-- #(?:end)?if {} -->", list)
        } else {
            format!(r"(?s)\s*<!-- #if {list} -->.*?<!-- #endif {list} -->", list = list)
        };
        content = Regex::new(&pattern)?.replace_all(&content, "").into_owned();
    }
    Ok(content)
}

/// Keys kept in `param*.json` of PS5 additional content.
pub const ADDITIONAL_CONTENT_PARAM_KEYS: [&str; 10] = [
    "ageLevel",
    "applicationDrmType",
    "attribute",
    "contentId",
    "contentVersion",
    "downloadDataSize",
    "localizedParameters",
    "masterVersion",
    "titleId",
    "versionFileUri",
];

/// Turn a PS5 application `.gp5` into an additional-content project:
/// the volume type becomes `prospero_ac` and executable entries
/// (`elf`, `prx`, `eboot`) are dropped.
pub fn rewrite_gp5_for_dlc(content: &str) -> Result<String> {
    let volume_type = Regex::new(r#"(<volume\b[^>]*?\btype=")[^"]*(")"#)?;
    let content = volume_type.replace_all(content, "${1}prospero_ac${2}");
    let volume_type_element = Regex::new(r"(<volume_type>)[^<]*(</volume_type>)")?;
    let content = volume_type_element.replace_all(&content, "${1}prospero_ac${2}");

    let executables =
        Regex::new(r#"(?i)[ \t]*<file\b[^>]*\b(?:targ_path|orig_path)="[^"]*(?:\.elf|\.prx|eboot[^"/]*)"[^>]*/>[ \t]*\r?\n?"#)?;
    Ok(executables.replace_all(&content, "").into_owned())
}

/// Keep only [`ADDITIONAL_CONTENT_PARAM_KEYS`] in a `param.json` document.
pub fn filter_param_json(content: &str) -> Result<String> {
    let mut json: serde_json::Value = serde_json::from_str(content).map_err(NimpError::from)?;
    if let Some(object) = json.as_object_mut() {
        object.retain(|key, _| ADDITIONAL_CONTENT_PARAM_KEYS.contains(&key.as_str()));
    }
    Ok(serde_json::to_string_pretty(&json).map_err(NimpError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(executable_name("Game", "PS4", "Development"), "Game");
        assert_eq!(executable_name("Game", "PS4", "Shipping"), "Game-PS4-Shipping");
    }

    #[test]
    fn test_substitution() {
        let result = transform(
            "<exe>{executable_name}</exe>{{literal}}",
            &params(&[("executable_name", "Game"), ("configuration", "Development")]),
        )
        .unwrap();
        assert_eq!(result, "<exe>Game</exe>{literal}");
        assert!(transform("{unknown}", &params(&[])).is_err());
    }

    #[test]
    fn test_shipping_strips_debug_blocks() {
        let template = "a<!-- #if Debug -->\n<debug/>\n<!-- #endif Debug -->b";
        let shipping = transform(template, &params(&[("configuration", "Shipping")])).unwrap();
        assert_eq!(shipping, "ab");
        let devel = transform(template, &params(&[("configuration", "Development")])).unwrap();
        assert_eq!(devel, template);
    }

    #[test]
    fn test_region_blocks() {
        let template = "<files>\n  <!-- #if SCEE -->\n  <e/>\n  <!-- #endif SCEE -->\n  <!-- #if SCEA,SCEJ -->\n  <aj/>\n  <!-- #endif SCEA,SCEJ -->\n  <all/>\n</files>";
        let europe = transform(template, &params(&[("configuration", "Shipping"), ("region", "scee")])).unwrap();
        assert!(europe.contains("<e/>"));
        assert!(!europe.contains("<aj/>"));
        assert!(!europe.contains("#if"));
        assert!(europe.contains("<all/>"));

        let america = transform(template, &params(&[("configuration", "Shipping"), ("region", "scea")])).unwrap();
        assert!(!america.contains("<e/>"));
        assert!(america.contains("<aj/>"));
        assert!(!america.contains("#endif"));
    }

    #[test]
    fn test_gp5_dlc_rewrite() {
        let gp5 = "<psproject>\n<volume type=\"prospero_app\" id=\"1\">\n</volume>\n<files>\n  <file targ_path=\"eboot.bin\" orig_path=\"Game.self\"/>\n  <file targ_path=\"lib/libfoo.prx\"/>\n  <file targ_path=\"content/pak0.pak\"/>\n</files>\n</psproject>";
        let result = rewrite_gp5_for_dlc(gp5).unwrap();
        assert!(result.contains("<volume type=\"prospero_ac\" id=\"1\">"));
        assert!(!result.contains("eboot"));
        assert!(!result.contains(".prx"));
        assert!(result.contains("pak0.pak"));
    }

    #[test]
    fn test_param_json_filter() {
        let filtered = filter_param_json(r#"{"titleId": "PPSA00001", "applicationCategoryType": 0, "contentVersion": "01.000.000"}"#).unwrap();
        let json: serde_json::Value = serde_json::from_str(&filtered).unwrap();
        assert_eq!(json["titleId"], "PPSA00001");
        assert!(json.get("applicationCategoryType").is_none());
        assert_eq!(json["contentVersion"], "01.000.000");
    }
}
