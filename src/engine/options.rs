use std::fmt::{Display, Formatter};

use anyhow::bail;
use itertools::Itertools;

use crate::util::{parse_int_from_str, Res, Tokens};

/// The typed part of a declared engine option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Check {
        default: Option<bool>,
    },
    Spin {
        default: Option<i64>,
        min: Option<i64>,
        max: Option<i64>,
    },
    Combo {
        default: Option<String>,
        vars: Vec<String>,
    },
    Button,
    Text {
        default: Option<String>,
    },
}

impl OptionValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Check { .. } => "check",
            OptionValue::Spin { .. } => "spin",
            OptionValue::Combo { .. } => "combo",
            OptionValue::Button => "button",
            OptionValue::Text { .. } => "string",
        }
    }
}

/// One option as declared by the engine during protocol startup.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct EngineOption {
    pub name: String,
    pub value: OptionValue,
}

impl Display for EngineOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (type {})", self.name, self.value.type_name())
    }
}

impl EngineOption {
    /// Parses the remainder of a UCI `option` line, i.e. everything after
    /// the `option` token: `name <tokens> type <type> [default ..] [min ..]
    /// [max ..] [var ..]*`. Option names may span multiple tokens.
    pub fn parse_declaration(mut words: Tokens) -> Res<Self> {
        match words.next() {
            Some("name") => {}
            Some(other) => bail!("Expected 'name' after 'option', got '{other}'"),
            None => bail!("Line ends after 'option'"),
        }
        let mut name_tokens = vec![];
        loop {
            match words.next() {
                Some("type") => break,
                Some(token) => name_tokens.push(token),
                None => bail!("Option declaration is missing 'type'"),
            }
        }
        if name_tokens.is_empty() {
            bail!("Option declaration has an empty name")
        }
        let name = name_tokens.iter().join(" ");
        let mut value = match words.next() {
            Some("check") => OptionValue::Check { default: None },
            Some("spin") => OptionValue::Spin {
                default: None,
                min: None,
                max: None,
            },
            Some("combo") => OptionValue::Combo {
                default: None,
                vars: vec![],
            },
            Some("button") => OptionValue::Button,
            Some("string") => OptionValue::Text { default: None },
            Some(other) => bail!("Unrecognized option type '{other}'"),
            None => bail!("Line ends after 'type'"),
        };
        while let Some(setting) = words.next() {
            let Some(word) = words.next() else {
                bail!("Missing value after '{setting}' in the declaration of option '{name}'")
            };
            match (setting, &mut value) {
                ("default", OptionValue::Check { default }) => {
                    *default = Some(match word {
                        "true" => true,
                        "false" => false,
                        _ => bail!("Check option '{name}' has the non-boolean default '{word}'"),
                    });
                }
                ("default", OptionValue::Spin { default, .. }) => {
                    *default = Some(parse_int_from_str(word, "spin default")?);
                }
                ("default", OptionValue::Combo { default, .. }) => {
                    *default = Some(word.to_string());
                }
                ("default", OptionValue::Text { default }) => {
                    let rest = words.clone().join(" ");
                    let mut text = word.to_string();
                    if !rest.is_empty() {
                        text.push(' ');
                        text.push_str(&rest);
                        while words.next().is_some() {}
                    }
                    if text == "<empty>" {
                        text.clear();
                    }
                    *default = Some(text);
                }
                ("min", OptionValue::Spin { min, .. }) => {
                    *min = Some(parse_int_from_str(word, "spin min")?);
                }
                ("max", OptionValue::Spin { max, .. }) => {
                    *max = Some(parse_int_from_str(word, "spin max")?);
                }
                ("var", OptionValue::Combo { vars, .. }) => vars.push(word.to_string()),
                (setting, value) => bail!(
                    "'{setting}' is not valid for option '{name}' of type '{}'",
                    value.type_name()
                ),
            }
        }
        Ok(Self { name, value })
    }

    /// Checks a value the user wants to set against the declared type and
    /// range. The error string names the reason; the caller decides whether
    /// to skip or abort.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match &self.value {
            OptionValue::Check { .. } => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!("'{value}' is not a boolean")),
            },
            OptionValue::Spin { min, max, .. } => {
                let n: i64 = value
                    .parse()
                    .map_err(|_| format!("'{value}' is not an integer"))?;
                if min.is_some_and(|min| n < min) || max.is_some_and(|max| n > max) {
                    return Err(format!(
                        "{n} is outside the declared range [{}, {}]",
                        min.map_or("?".to_string(), |m| m.to_string()),
                        max.map_or("?".to_string(), |m| m.to_string())
                    ));
                }
                Ok(())
            }
            OptionValue::Combo { vars, .. } => {
                if vars.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not one of the declared choices"))
                }
            }
            OptionValue::Button => Err("a button takes no value".to_string()),
            OptionValue::Text { .. } => Ok(()),
        }
    }
}

/// The options one engine declared, in declaration order.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct OptionTable {
    options: Vec<EngineOption>,
}

impl OptionTable {
    pub fn add(&mut self, option: EngineOption) {
        // Redeclaring an option replaces the earlier declaration.
        self.options.retain(|o| !o.name.eq_ignore_ascii_case(&option.name));
        self.options.push(option);
    }

    pub fn find(&self, name: &str) -> Option<&EngineOption> {
        self.options
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineOption> {
        self.options.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::tokens;

    fn parse(line: &str) -> EngineOption {
        EngineOption::parse_declaration(tokens(line)).unwrap()
    }

    #[test]
    fn parses_spin_with_range() {
        let option = parse("name Hash type spin default 16 min 1 max 4096");
        assert_eq!(option.name, "Hash");
        assert_eq!(
            option.value,
            OptionValue::Spin {
                default: Some(16),
                min: Some(1),
                max: Some(4096)
            }
        );
        assert!(option.validate("64").is_ok());
        assert!(option.validate("0").is_err());
        assert!(option.validate("lots").is_err());
    }

    #[test]
    fn parses_multi_token_names() {
        let option = parse("name Clear Hash type button");
        assert_eq!(option.name, "Clear Hash");
        assert_eq!(option.value, OptionValue::Button);
    }

    #[test]
    fn parses_combo_vars_and_empty_string_default() {
        let option = parse("name Style type combo default Normal var Solid var Normal var Risky");
        assert!(option.validate("risky").is_ok());
        assert!(option.validate("Swindle").is_err());
        let option = parse("name SyzygyPath type string default <empty>");
        assert_eq!(
            option.value,
            OptionValue::Text {
                default: Some(String::new())
            }
        );
    }

    #[test]
    fn rejects_malformed_declarations() {
        assert!(EngineOption::parse_declaration(tokens("Hash type spin")).is_err());
        assert!(EngineOption::parse_declaration(tokens("name Hash")).is_err());
        assert!(EngineOption::parse_declaration(tokens("name Hash type banana")).is_err());
    }

    #[test]
    fn redeclaration_replaces() {
        let mut table = OptionTable::default();
        table.add(parse("name Hash type spin default 16 min 1 max 64"));
        table.add(parse("name Hash type spin default 32 min 1 max 128"));
        assert_eq!(table.len(), 1);
        assert!(table.find("hash").unwrap().validate("128").is_ok());
    }
}
