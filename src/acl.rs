//! The static ACL catalog.
//!
//! Writes may name one of eight server-defined permission sets. The client
//! forwards the identifier verbatim and never interprets its semantics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Acl {
    #[serde(rename = "$private")]
    Private,
    #[serde(rename = "$publicRead")]
    PublicRead,
    #[serde(rename = "$publicWrite")]
    PublicWrite,
    #[serde(rename = "$publicCreate")]
    PublicCreate,
    #[serde(rename = "$publicReadWrite")]
    PublicReadWrite,
    #[serde(rename = "$publicReadCreate")]
    PublicReadCreate,
    #[serde(rename = "$publicWriteCreate")]
    PublicWriteCreate,
    #[serde(rename = "$publicReadWriteCreate")]
    PublicReadWriteCreate,
}

impl Acl {
    pub const ALL: [Acl; 8] = [
        Acl::Private,
        Acl::PublicRead,
        Acl::PublicWrite,
        Acl::PublicCreate,
        Acl::PublicReadWrite,
        Acl::PublicReadCreate,
        Acl::PublicWriteCreate,
        Acl::PublicReadWriteCreate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Acl::Private => "$private",
            Acl::PublicRead => "$publicRead",
            Acl::PublicWrite => "$publicWrite",
            Acl::PublicCreate => "$publicCreate",
            Acl::PublicReadWrite => "$publicReadWrite",
            Acl::PublicReadCreate => "$publicReadCreate",
            Acl::PublicWriteCreate => "$publicWriteCreate",
            Acl::PublicReadWriteCreate => "$publicReadWriteCreate",
        }
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Acl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Acl::ALL
            .iter()
            .copied()
            .find(|acl| acl.as_str() == s)
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown ACL identifier `{s}`")))
    }
}
