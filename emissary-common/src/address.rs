use std::{
    fmt::{self, Display},
    slice,
    str::FromStr,
};

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A recipient or sender address that cannot be used on the wire.
///
/// Raised while parsing, and by an [`AddressEncoder`](crate::encoder::AddressEncoder)
/// when an address has no DNS-safe form. Only the offending address is
/// dropped; the rest of a batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Address has no domain part: {0}")]
    MissingDomain(String),

    #[error("Address has an empty local part: {0}")]
    EmptyLocalPart(String),

    #[error("Unable to parse address list: {0}")]
    Unparseable(String),

    #[error("Domain {domain} cannot be converted to ASCII: {reason}")]
    Idna { domain: String, reason: String },

    #[error("Local part of {0} requires SMTPUTF8")]
    NonAsciiLocalPart(String),
}

/// An envelope address, split at its final `@`.
///
/// The local part is kept exactly as supplied; no case folding is applied
/// to either part.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    local_part: String,
    domain: String,
}

impl Address {
    /// Builds an address from already separated parts.
    ///
    /// # Errors
    ///
    /// If either part is empty.
    pub fn new(local_part: impl Into<String>, domain: impl Into<String>) -> Result<Self, AddressError> {
        let local_part = local_part.into();
        let domain = domain.into();

        if local_part.is_empty() {
            return Err(AddressError::EmptyLocalPart(format!("@{domain}")));
        }

        if domain.is_empty() {
            return Err(AddressError::MissingDomain(format!("{local_part}@")));
        }

        Ok(Self { local_part, domain })
    }

    #[inline]
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether the address can be sent without any encoding.
    #[must_use]
    pub fn is_ascii(&self) -> bool {
        self.local_part.is_ascii() && self.domain.is_ascii()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('<').trim_end_matches('>');

        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let (local_part, domain) = trimmed
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingDomain(trimmed.to_string()))?;

        if local_part.is_empty() {
            return Err(AddressError::EmptyLocalPart(trimmed.to_string()));
        }

        if domain.is_empty() {
            return Err(AddressError::MissingDomain(trimmed.to_string()));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// An address paired with its optional display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: Address,
    pub display_name: Option<String>,
}

impl Mailbox {
    #[must_use]
    pub const fn new(address: Address, display_name: Option<String>) -> Self {
        Self {
            address,
            display_name,
        }
    }
}

impl From<Address> for Mailbox {
    fn from(address: Address) -> Self {
        Self::new(address, None)
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => Display::fmt(&self.address, f),
        }
    }
}

/// An ordered address to display-name mapping.
///
/// Behaves like a map keyed on [`Address`]: inserting an address that is
/// already present replaces its display name but keeps its position, so
/// iteration order is always first-seen order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailboxes(Vec<Mailbox>);

impl Mailboxes {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Parses an RFC 5322 address list such as `Alice <alice@example.com>, bob@example.org`.
    /// Group syntax is flattened into its members.
    ///
    /// # Errors
    ///
    /// If the list is not syntactically valid or any member lacks a domain.
    pub fn parse(list: &str) -> Result<Self, AddressError> {
        let parsed =
            mailparse::addrparse(list).map_err(|e| AddressError::Unparseable(e.to_string()))?;

        let mut mailboxes = Self::new();
        for addr in parsed.iter() {
            match addr {
                mailparse::MailAddr::Single(single) => {
                    mailboxes.insert(single.addr.parse()?, single.display_name.clone());
                }
                mailparse::MailAddr::Group(group) => {
                    for single in &group.addrs {
                        mailboxes.insert(single.addr.parse()?, single.display_name.clone());
                    }
                }
            }
        }

        Ok(mailboxes)
    }

    /// Adds an address, or updates the display name of an existing one.
    pub fn insert(&mut self, address: Address, display_name: Option<String>) {
        if let Some(existing) = self.0.iter_mut().find(|m| m.address == address) {
            existing.display_name = display_name;
        } else {
            self.0.push(Mailbox::new(address, display_name));
        }
    }

    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.0.iter().any(|m| &m.address == address)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Mailbox> {
        self.0.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.0.iter().map(|m| &m.address)
    }

    /// Union of several mappings in argument order, each address once.
    #[must_use]
    pub fn merged<'a>(lists: impl IntoIterator<Item = &'a Self>) -> Vec<Address> {
        let mut seen = AHashSet::new();
        lists
            .into_iter()
            .flat_map(Self::addresses)
            .filter(|address| seen.insert(*address))
            .cloned()
            .collect()
    }
}

impl FromIterator<Mailbox> for Mailboxes {
    fn from_iter<T: IntoIterator<Item = Mailbox>>(iter: T) -> Self {
        let mut mailboxes = Self::new();
        for mailbox in iter {
            mailboxes.insert(mailbox.address, mailbox.display_name);
        }
        mailboxes
    }
}

impl FromIterator<Address> for Mailboxes {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        iter.into_iter().map(Mailbox::from).collect()
    }
}

impl<'a> IntoIterator for &'a Mailboxes {
    type Item = &'a Mailbox;
    type IntoIter = slice::Iter<'a, Mailbox>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
