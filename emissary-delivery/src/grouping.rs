//! Splitting a message's recipients into per-domain batches.

use ahash::AHashMap;
use emissary_common::{Address, AddressEncoder, internal};

use crate::dns::MailServer;

/// The recipients of one domain and the exchangers to try for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientGroup {
    /// DNS-safe, lower-cased domain.
    pub domain: String,
    /// Candidate hosts, most preferred first. Empty until resolved.
    pub hosts: Vec<MailServer>,
    /// `to` and `cc` addresses, delivered together.
    pub primary: Vec<Address>,
    /// `bcc` addresses, each delivered in its own transaction.
    pub bcc: Vec<Address>,
}

impl RecipientGroup {
    fn new(domain: String) -> Self {
        Self {
            domain,
            hosts: Vec::new(),
            primary: Vec::new(),
            bcc: Vec::new(),
        }
    }

    /// Every address of the group, primary first.
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.primary.iter().chain(&self.bcc)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.primary.len() + self.bcc.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.bcc.is_empty()
    }
}

/// The result of grouping: routable batches in first-seen domain order,
/// and the recipients whose domain has no DNS-safe form.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub groups: Vec<RecipientGroup>,
    pub unroutable: Vec<Address>,
}

/// Buckets `primary` and `bcc` by domain.
///
/// Domains appear in the order they are first seen, primary recipients
/// before bcc, and addresses keep their order within each bucket. Domains
/// are compared after DNS-safe encoding and lower-casing; local parts are
/// left exactly as given.
pub fn group_recipients(
    primary: &[Address],
    bcc: &[Address],
    encoder: &dyn AddressEncoder,
) -> Grouping {
    let mut grouping = Grouping::default();
    let mut index: AHashMap<String, usize> = AHashMap::new();

    let tagged = primary
        .iter()
        .map(|address| (address, false))
        .chain(bcc.iter().map(|address| (address, true)));

    for (address, is_bcc) in tagged {
        let domain = match encoder.encode_domain(address.domain()) {
            Ok(domain) => domain.to_ascii_lowercase(),
            Err(error) => {
                internal!(level = WARN, "Cannot route {address}: {error}");
                grouping.unroutable.push(address.clone());
                continue;
            }
        };

        let slot = *index.entry(domain.clone()).or_insert_with(|| {
            grouping.groups.push(RecipientGroup::new(domain));
            grouping.groups.len() - 1
        });

        let group = &mut grouping.groups[slot];
        if is_bcc {
            group.bcc.push(address.clone());
        } else {
            group.primary.push(address.clone());
        }
    }

    grouping
}
