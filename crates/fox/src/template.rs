//! `${token}` substitution for output names.

use crate::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*)|(\$))")
            .expect("token pattern is valid")
    })
}

/// Values for the output name tokens of one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputVars {
    pub app_name: String,
    pub marketing_version: String,
    pub build_version: String,
    pub config: String,
}

impl OutputVars {
    fn as_map(&self) -> BTreeMap<&'static str, &str> {
        BTreeMap::from([
            ("app_name", self.app_name.as_str()),
            ("marketing_version", self.marketing_version.as_str()),
            ("build_version", self.build_version.as_str()),
            ("config", self.config.as_str()),
        ])
    }
}

/// Substitute `${name}` / `$name` tokens; `$$` is a literal `$`.
///
/// Unknown tokens are a configuration error.
pub fn substitute(template: &str, vars: &OutputVars) -> Result<String> {
    let values = vars.as_map();
    let mut unknown = None;

    let rendered = token_pattern().replace_all(template, |caps: &Captures<'_>| {
        if caps.get(3).is_some() {
            return "$".to_string();
        }
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match values.get(name) {
            Some(value) => (*value).to_string(),
            None => {
                unknown.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match unknown {
        Some(name) => Err(Error::Config(format!(
            "unknown token '${{{name}}}' in output template '{template}'"
        ))),
        None => Ok(rendered.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_IPA_OUTPUT_TEMPLATE;

    fn vars() -> OutputVars {
        OutputVars {
            app_name: "App".into(),
            marketing_version: "1.2".into(),
            build_version: "42".into(),
            config: "Release".into(),
        }
    }

    #[test]
    fn test_default_template() {
        assert_eq!(
            substitute(DEFAULT_IPA_OUTPUT_TEMPLATE, &vars()).unwrap(),
            "App_1.2_42_Release.ipa"
        );
    }

    #[test]
    fn test_bare_and_escaped_tokens() {
        assert_eq!(
            substitute("builds/$config/$app_name-$$1.ipa", &vars()).unwrap(),
            "builds/Release/App-$1.ipa"
        );
    }

    #[test]
    fn test_plain_path_untouched() {
        assert_eq!(substitute("out/App.ipa", &vars()).unwrap(), "out/App.ipa");
    }

    #[test]
    fn test_unknown_token() {
        let err = substitute("${team}.ipa", &vars()).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("team")));
    }
}
