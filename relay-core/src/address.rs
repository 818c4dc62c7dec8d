//! Protocol Addresses
//!
//! `user.device` addressing. A bare user id means "every device".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty user id")]
    EmptyUser,

    #[error("invalid device id: {0}")]
    InvalidDevice(String),
}

/// A user, optionally narrowed to one of their devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    user_id: String,
    device_id: Option<u32>,
}

impl Address {
    /// Address covering all devices of `user_id`.
    pub fn user(user_id: impl Into<String>) -> Self {
        Address {
            user_id: user_id.into(),
            device_id: None,
        }
    }

    /// Address of a single device.
    pub fn device(user_id: impl Into<String>, device_id: u32) -> Self {
        Address {
            user_id: user_id.into(),
            device_id: Some(device_id),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    /// Same user, narrowed to `device_id`.
    pub fn with_device(&self, device_id: u32) -> Self {
        Address::device(self.user_id.clone(), device_id)
    }

    /// Same user, all devices.
    pub fn without_device(&self) -> Self {
        Address::user(self.user_id.clone())
    }

    /// Returns true if both addresses name the same user.
    pub fn same_user(&self, other: &Address) -> bool {
        self.user_id == other.user_id
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_id {
            Some(device) => write!(f, "{}.{}", self.user_id, device),
            None => f.write_str(&self.user_id),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) = match s.rsplit_once('.') {
            Some((user, device)) => {
                let id = device
                    .parse::<u32>()
                    .map_err(|_| AddressError::InvalidDevice(device.to_string()))?;
                (user, Some(id))
            }
            None => (s, None),
        };
        if user.is_empty() {
            return Err(AddressError::EmptyUser);
        }
        Ok(Address {
            user_id: user.to_string(),
            device_id: device,
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
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}
