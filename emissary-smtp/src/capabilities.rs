//! Service extensions advertised in the EHLO reply.

use ahash::AHashMap;

use crate::response::Response;

/// Keywords (upper-cased) and their parameters from an EHLO reply.
///
/// Empty after a HELO fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    extensions: AHashMap<String, Vec<String>>,
}

impl Capabilities {
    /// The first reply line is the server's greeting, the rest are
    /// `KEYWORD [PARAM ...]`.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let extensions = response
            .lines
            .iter()
            .skip(1)
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                let keyword = words.next()?.to_ascii_uppercase();
                Some((keyword, words.map(str::to_string).collect()))
            })
            .collect();

        Self { extensions }
    }

    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions.contains_key(&keyword.to_ascii_uppercase())
    }

    #[must_use]
    pub fn params(&self, keyword: &str) -> Option<&[String]> {
        self.extensions
            .get(&keyword.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// The server's `SIZE` limit, if it advertised one. `SIZE 0` means no
    /// fixed limit.
    #[must_use]
    pub fn size_limit(&self) -> Option<usize> {
        self.params("SIZE")?
            .first()?
            .parse()
            .ok()
            .filter(|limit| *limit > 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
