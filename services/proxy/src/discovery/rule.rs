//! Router rule grammar.
//!
//! Backends describe the hostnames they serve with rule strings such as:
//!
//! ```text
//! Host(`app.localhost`) || HostRegexp(`{subdomain:[a-zA-Z0-9-]+}.app.localhost`)
//! ```
//!
//! Only an alternation (`||`) of `Host` and `HostRegexp` matchers is accepted.
//! `HostRegexp` must be a single leading label variable followed by a literal
//! suffix; the variable's pattern, when present, must be `[a-zA-Z0-9-]+`.

use thiserror::Error;

use crate::proxy::{is_valid_hostname, normalize_hostname, HostPattern};

/// The only label regex accepted inside `HostRegexp`.
pub const LABEL_REGEX: &str = "[a-zA-Z0-9-]+";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule is empty")]
    Empty,

    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: String,
        expected: &'static str,
    },

    #[error("unsupported matcher '{0}' (only Host and HostRegexp are supported)")]
    UnsupportedMatcher(String),

    #[error("unsupported host regexp '{0}'")]
    UnsupportedRegexp(String),

    #[error("invalid hostname '{0}'")]
    InvalidHost(String),
}

/// Parse a rule string into the host patterns it matches.
///
/// Duplicate patterns are collapsed; order of first appearance is kept.
pub fn parse_rule(rule: &str) -> Result<Vec<HostPattern>, RuleError> {
    let mut parser = Parser::new(rule);
    parser.skip_ws();
    if parser.at_end() {
        return Err(RuleError::Empty);
    }

    let mut patterns = Vec::new();
    loop {
        for pattern in parser.matcher()? {
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }

        parser.skip_ws();
        if parser.at_end() {
            break;
        }
        parser.expect("||", "'||' or end of rule")?;
    }

    Ok(patterns)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn unexpected(&self, expected: &'static str) -> RuleError {
        let found = match self.rest().chars().next() {
            Some(c) => format!("'{c}'"),
            None => "end of rule".to_string(),
        };
        RuleError::Unexpected {
            offset: self.pos,
            found,
            expected,
        }
    }

    fn expect(&mut self, token: &str, expected: &'static str) -> Result<(), RuleError> {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn ident(&mut self) -> Result<&'a str, RuleError> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.unexpected("a matcher name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// A backtick- or double-quote-delimited argument.
    fn argument(&mut self) -> Result<&'a str, RuleError> {
        self.skip_ws();
        let rest = self.rest();
        let Some(quote) = rest.chars().next().filter(|c| *c == '`' || *c == '"') else {
            return Err(self.unexpected("a quoted argument"));
        };
        let Some(end) = rest[1..].find(quote) else {
            self.pos = self.input.len();
            return Err(self.unexpected("a closing quote"));
        };
        self.pos += end + 2;
        Ok(&rest[1..=end])
    }

    fn arguments(&mut self) -> Result<Vec<&'a str>, RuleError> {
        self.expect("(", "'('")?;
        let mut args = vec![self.argument()?];
        loop {
            self.skip_ws();
            if self.rest().starts_with(',') {
                self.pos += 1;
                args.push(self.argument()?);
            } else {
                self.expect(")", "',' or ')'")?;
                return Ok(args);
            }
        }
    }

    fn matcher(&mut self) -> Result<Vec<HostPattern>, RuleError> {
        let name = self.ident()?;
        match name {
            "Host" => self
                .arguments()?
                .into_iter()
                .map(exact_host)
                .collect(),
            "HostRegexp" => self
                .arguments()?
                .into_iter()
                .map(wildcard_host)
                .collect(),
            other => Err(RuleError::UnsupportedMatcher(other.to_string())),
        }
    }
}

fn exact_host(raw: &str) -> Result<HostPattern, RuleError> {
    let host = normalize_hostname(raw);
    if !is_valid_hostname(&host) {
        return Err(RuleError::InvalidHost(raw.to_string()));
    }
    Ok(HostPattern::Exact(host))
}

fn wildcard_host(raw: &str) -> Result<HostPattern, RuleError> {
    let unsupported = || RuleError::UnsupportedRegexp(raw.to_string());

    let body = raw.trim().strip_prefix('{').ok_or_else(unsupported)?;
    let (variable, suffix) = body.split_once("}.").ok_or_else(unsupported)?;

    match variable.split_once(':') {
        Some((name, regex)) => {
            if name.is_empty() || regex != LABEL_REGEX {
                return Err(unsupported());
            }
        }
        None if variable.is_empty() => return Err(unsupported()),
        None => {}
    }

    let suffix = normalize_hostname(suffix);
    if !is_valid_hostname(&suffix) {
        return Err(RuleError::InvalidHost(raw.to_string()));
    }
    Ok(HostPattern::Wildcard { suffix })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_and_wildcard_alternation() {
        let patterns = parse_rule(
            "Host(`app.localhost`) || HostRegexp(`{subdomain:[a-zA-Z0-9-]+}.app.localhost`)",
        )
        .unwrap();
        assert_eq!(
            patterns,
            vec![
                HostPattern::exact("app.localhost"),
                HostPattern::wildcard("app.localhost"),
            ]
        );
    }

    #[test]
    fn test_parse_single_host() {
        let patterns = parse_rule("Host(`API.Localhost`)").unwrap();
        assert_eq!(patterns, vec![HostPattern::exact("api.localhost")]);
    }

    #[test]
    fn test_parse_multiple_arguments_and_quotes() {
        let patterns = parse_rule(r#"Host(`a.localhost`, "b.localhost")"#).unwrap();
        assert_eq!(
            patterns,
            vec![
                HostPattern::exact("a.localhost"),
                HostPattern::exact("b.localhost"),
            ]
        );
    }

    #[test]
    fn test_parse_bare_variable() {
        let patterns = parse_rule("HostRegexp(`{name}.dev.localhost`)").unwrap();
        assert_eq!(patterns, vec![HostPattern::wildcard("dev.localhost")]);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let patterns = parse_rule("Host(`a.localhost`) || Host(`a.localhost`)").unwrap();
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn test_rejects_other_regexps() {
        let err = parse_rule("HostRegexp(`{sub:.+}.app.localhost`)").unwrap_err();
        assert!(matches!(err, RuleError::UnsupportedRegexp(_)));

        let err = parse_rule("HostRegexp(`^api.*$`)").unwrap_err();
        assert!(matches!(err, RuleError::UnsupportedRegexp(_)));
    }

    #[test]
    fn test_rejects_other_matchers_and_operators() {
        let err = parse_rule("PathPrefix(`/api`)").unwrap_err();
        assert_eq!(err, RuleError::UnsupportedMatcher("PathPrefix".to_string()));

        let err = parse_rule("Host(`a.localhost`) && Host(`b.localhost`)").unwrap_err();
        assert!(matches!(err, RuleError::Unexpected { .. }));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(parse_rule("   "), Err(RuleError::Empty));
        assert!(parse_rule("Host(`app.localhost`").is_err());
        assert!(parse_rule("Host(`app.localhost)").is_err());
        assert!(parse_rule("Host()").is_err());
        assert!(matches!(
            parse_rule("Host(`bad host`)"),
            Err(RuleError::InvalidHost(_))
        ));
    }
}
