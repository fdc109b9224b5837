use super::ports::Record;
use super::risk::CustomerSignals;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Registration input. `id` is generated when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewCustomer {
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub zip_code: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    /// IPs of previously succeeded payments.
    #[serde(default)]
    pub known_ips: BTreeSet<String>,
    #[serde(default)]
    pub known_devices: BTreeSet<String>,
}

impl Customer {
    pub fn register(input: NewCustomer, now: DateTime<Utc>) -> Result<Self> {
        if input.name.trim().is_empty() {
            return Err(EngineError::validation("Customer name is required"));
        }
        if !input.email.contains('@') {
            return Err(EngineError::validation(format!(
                "Invalid email '{}'",
                input.email
            )));
        }
        let id = match input.id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::validation("Customer id must not be blank"));
            }
            Some(id) => id,
            None => format!("cus_{}", Uuid::new_v4().simple()),
        };

        Ok(Self {
            id,
            name: input.name,
            email: input.email,
            phone: input.phone,
            address: input.address,
            city: input.city,
            state: input.state,
            country: input.country,
            zip_code: input.zip_code,
            metadata: input.metadata,
            verified: input.verified,
            created_at: now,
            known_ips: BTreeSet::new(),
            known_devices: BTreeSet::new(),
        })
    }

    pub fn account_age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    pub fn signals(&self, prior_payments: u32, now: DateTime<Utc>) -> CustomerSignals {
        CustomerSignals {
            account_age_days: Some(self.account_age_days(now)),
            verified: self.verified,
            prior_payments: Some(prior_payments),
        }
    }

    pub fn knows_ip(&self, ip: &str) -> bool {
        self.known_ips.contains(ip)
    }

    pub fn knows_device(&self, device: &str) -> bool {
        self.known_devices.contains(device)
    }

    /// Records the network signals of a succeeded payment. Returns whether anything changed.
    pub fn remember(&mut self, ip: Option<&str>, device: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
            changed |= self.known_ips.insert(ip.to_string());
        }
        if let Some(device) = device.filter(|d| !d.is_empty()) {
            changed |= self.known_devices.insert(device.to_string());
        }
        changed
    }
}

impl Record for Customer {
    const KIND: &'static str = "customers";

    fn key(&self) -> &str {
        &self.id
    }
}
