//! Trusted bearer tokens and their extraction from requests.

use serde::Deserialize;
use subtle::{Choice, ConstantTimeEq};

use crate::config::StringList;

/// Literal prefix of a bearer Authorization header.
const BEARER_PREFIX: &str = "Bearer ";

/// Set of secret tokens whose bearer grants an unconditional bypass.
///
/// The values never appear in `Debug` output.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "StringList")]
pub struct TrustedTokens {
    tokens: Vec<String>,
}

impl TrustedTokens {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `candidate` equals one of the configured tokens.
    ///
    /// Every configured token is compared in constant time and the scan never
    /// stops early, so timing does not reveal which entry matched or how
    /// long a shared prefix was.
    pub fn contains(&self, candidate: &str) -> bool {
        let candidate = candidate.as_bytes();
        let matched = self
            .tokens
            .iter()
            .fold(Choice::from(0), |acc, token| {
                acc | constant_time_eq(token.as_bytes(), candidate)
            });
        matched.into()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<StringList> for TrustedTokens {
    fn from(StringList(tokens): StringList) -> Self {
        Self { tokens }
    }
}

impl std::fmt::Debug for TrustedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrustedTokens([REDACTED; {}])", self.tokens.len())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> Choice {
    if a.len() != b.len() {
        return Choice::from(0);
    }
    a.ct_eq(b)
}

/// Extract the bearer token from an Authorization header value.
///
/// Everything after the literal `"Bearer "` prefix is the token. A missing
/// header, or one without that prefix, yields the empty string.
pub fn bearer_token(authorization: Option<&str>) -> &str {
    authorization
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .unwrap_or("")
}
