//! two phase commit transaction identifiers.

use core::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::errors::Error;

/// a distributed transaction identifier.
///
/// parsed xids carry the XA triple; anything else (e.g. a transaction
/// prepared by another tool) is kept verbatim in `gtrid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    format_id: Option<i32>,
    gtrid: String,
    bqual: Option<String>,
}

impl Xid {
    /// build a validated xid from the XA triple.
    pub fn from_parts(format_id: i32, gtrid: &str, bqual: &str) -> Result<Self, Error> {
        if !(0..=0x7fff_ffff).contains(&format_id) {
            return Err(Error::programming("format_id must be a non-negative 32-bit integer"));
        }
        if gtrid.len() > 64 {
            return Err(Error::programming("gtrid must be a string no longer than 64 characters"));
        }
        if bqual.len() > 64 {
            return Err(Error::programming("bqual must be a string no longer than 64 characters"));
        }
        Ok(Self {
            format_id: Some(format_id),
            gtrid: gtrid.to_string(),
            bqual: Some(bqual.to_string()),
        })
    }

    /// parse the canonical encoding, falling back to an opaque identifier.
    pub fn from_string(s: &str) -> Self {
        Self::parse_string(s).unwrap_or_else(|| Self {
            format_id: None,
            gtrid: s.to_string(),
            bqual: None,
        })
    }

    fn parse_string(s: &str) -> Option<Self> {
        let mut it = s.splitn(3, '_');
        let format_id: i32 = it.next()?.parse().ok()?;
        let gtrid = String::from_utf8(BASE64.decode(it.next()?).ok()?).ok()?;
        let bqual = String::from_utf8(BASE64.decode(it.next()?).ok()?).ok()?;
        Self::from_parts(format_id, &gtrid, &bqual).ok()
    }

    pub fn format_id(&self) -> Option<i32> {
        self.format_id
    }

    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    pub fn bqual(&self) -> Option<&str> {
        self.bqual.as_deref()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.format_id, &self.bqual) {
            (Some(format_id), Some(bqual)) => write!(
                f,
                "{format_id}_{}_{}",
                BASE64.encode(&self.gtrid),
                BASE64.encode(bqual)
            ),
            _ => f.write_str(&self.gtrid),
        }
    }
}
