//! Queue addresses in the `queue@machine` form used by callers.

use crate::error::AddressError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const MACHINE_SEPARATOR: char = '@';
const DISCRIMINATOR_SEPARATOR: char = '-';
const QUALIFIER_SEPARATOR: char = '.';

/// Name of the machine this process runs on.
///
/// Falls back to `localhost` when neither `COMPUTERNAME` nor `HOSTNAME` is set.
pub fn local_machine_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A parsed `(queue, machine)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAddress {
    queue: String,
    machine: String,
}

impl QueueAddress {
    /// Create an address from already validated parts.
    pub fn new(queue: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            machine: machine.into(),
        }
    }

    /// Parse `queue`, `queue@machine` or `queue@.`.
    ///
    /// A missing machine, `.`, `localhost` and loopback IP addresses all
    /// resolve to `local_machine`.
    pub fn parse(address: &str, local_machine: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut parts = address.split(MACHINE_SEPARATOR);
        let queue = parts.next().unwrap_or_default();
        let machine = parts.next();
        if parts.next().is_some() {
            return Err(AddressError::MultipleMachineSeparators {
                address: address.to_string(),
            });
        }

        if queue.is_empty() {
            return Err(AddressError::EmptyQueue {
                address: address.to_string(),
            });
        }

        let machine = match machine {
            None => local_machine.to_string(),
            Some("") => {
                return Err(AddressError::EmptyMachine {
                    address: address.to_string(),
                })
            }
            Some(machine) if refers_to_local_machine(machine) => local_machine.to_string(),
            Some(machine) => machine.to_string(),
        };

        Ok(Self {
            queue: queue.to_string(),
            machine,
        })
    }

    /// Build the address of an endpoint queue, e.g. `sales-blue.timeouts@host`.
    pub fn for_endpoint(
        endpoint: &str,
        discriminator: Option<&str>,
        qualifier: Option<&str>,
        machine: &str,
    ) -> Self {
        let mut queue = endpoint.to_string();
        if let Some(discriminator) = discriminator.filter(|d| !d.is_empty()) {
            queue.push(DISCRIMINATOR_SEPARATOR);
            queue.push_str(discriminator);
        }
        if let Some(qualifier) = qualifier.filter(|q| !q.is_empty()) {
            queue.push(QUALIFIER_SEPARATOR);
            queue.push_str(qualifier);
        }
        Self::new(queue, machine)
    }

    /// Same machine, queue name extended with `suffix`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self::new(format!("{}{}", self.queue, suffix), self.machine.clone())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Check if the queue lives on `local_machine` (case-insensitive).
    pub fn is_local(&self, local_machine: &str) -> bool {
        self.machine.eq_ignore_ascii_case(local_machine) || refers_to_local_machine(&self.machine)
    }

    /// Direct format name understood by the native queuing service.
    pub fn format_name(&self) -> String {
        if self.machine.parse::<IpAddr>().is_ok() {
            format!("DIRECT=TCP:{}\\private$\\{}", self.machine, self.queue)
        } else {
            format!("DIRECT=OS:{}\\private$\\{}", self.machine, self.queue)
        }
    }

    /// Case-insensitive key identifying the physical queue.
    pub fn key(&self) -> String {
        format!(
            "{}{}{}",
            self.queue.to_lowercase(),
            MACHINE_SEPARATOR,
            self.machine.to_lowercase()
        )
    }
}

impl std::fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.queue, MACHINE_SEPARATOR, self.machine)
    }
}

fn refers_to_local_machine(machine: &str) -> bool {
    if machine == "." || machine.eq_ignore_ascii_case("localhost") {
        return true;
    }
    machine
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "address_tests.rs"]
mod tests;
