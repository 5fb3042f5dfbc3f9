//! Conversion of envelope addresses into the form placed on the wire.

use std::fmt::Debug;

use crate::address::{Address, AddressError};

/// Turns an [`Address`] into the string sent in `MAIL FROM`/`RCPT TO`,
/// and a domain into the name handed to DNS.
pub trait AddressEncoder: Send + Sync + Debug {
    /// # Errors
    ///
    /// If the address has no representation this encoder can produce.
    fn encode(&self, address: &Address) -> Result<String, AddressError>;

    /// # Errors
    ///
    /// If the domain has no DNS-safe form.
    fn encode_domain(&self, domain: &str) -> Result<String, AddressError>;
}

/// Converts internationalised domains to their ASCII-compatible (punycode)
/// form. Local parts must already be ASCII.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdnAddressEncoder;

impl AddressEncoder for IdnAddressEncoder {
    fn encode(&self, address: &Address) -> Result<String, AddressError> {
        if !address.local_part().is_ascii() {
            return Err(AddressError::NonAsciiLocalPart(address.to_string()));
        }

        let domain = self.encode_domain(address.domain())?;
        Ok(format!("{}@{domain}", address.local_part()))
    }

    fn encode_domain(&self, domain: &str) -> Result<String, AddressError> {
        let encoded = idna::domain_to_ascii_strict(domain).map_err(|e| AddressError::Idna {
            domain: domain.to_string(),
            reason: format!("{e:?}"),
        })?;

        if encoded.is_empty() {
            return Err(AddressError::Idna {
                domain: domain.to_string(),
                reason: "empty after conversion".to_string(),
            });
        }

        Ok(encoded)
    }
}

/// Passes addresses through untouched, for servers advertising `SMTPUTF8`.
///
/// Domains handed to DNS are still converted to ASCII.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8AddressEncoder;

impl AddressEncoder for Utf8AddressEncoder {
    fn encode(&self, address: &Address) -> Result<String, AddressError> {
        Ok(address.to_string())
    }

    fn encode_domain(&self, domain: &str) -> Result<String, AddressError> {
        IdnAddressEncoder.encode_domain(domain)
    }
}
