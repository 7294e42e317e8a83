//! Validation of topic, subscription and client names.
//!
//! # Validation Rules
//!
//! All identifiers must:
//! - Not be empty
//! - Not exceed their maximum length
//! - Contain only ASCII alphanumeric characters, dots (`.`), underscores (`_`), and hyphens (`-`)
//! - Not be "." or ".."
//! - Not start with a hyphen
//!
//! Subscription names additionally may not be all digits: cursor records and
//! message bodies share the `<topic>/p<N>/` key prefix in the log store.

use crate::constants::{MAX_CLIENT_NAME_LENGTH, MAX_TOPIC_NAME_LENGTH};
use crate::error::{Error, Result};
use crate::types::PartitionId;

/// Validate a topic name.
///
/// ```
/// use bundlemq::cluster::validate_topic_name;
///
/// assert!(validate_topic_name("orders.eu").is_ok());
/// assert!(validate_topic_name("orders/eu").is_err());
/// ```
pub fn validate_topic_name(topic: &str) -> Result<()> {
    validate_identifier(topic, MAX_TOPIC_NAME_LENGTH, "Topic name")
}

/// Validate a subscription name.
///
/// ```
/// use bundlemq::cluster::validate_subscription_name;
///
/// assert!(validate_subscription_name("audit").is_ok());
/// assert!(validate_subscription_name("42").is_err());
/// ```
pub fn validate_subscription_name(name: &str) -> Result<()> {
    validate_identifier(name, MAX_CLIENT_NAME_LENGTH, "Subscription name")?;
    if name.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgument(format!(
            "Subscription name '{name}' cannot be purely numeric"
        )));
    }
    Ok(())
}

/// Validate the client-chosen part of a connection name.
pub fn validate_client_name(name: &str) -> Result<()> {
    validate_identifier(name, MAX_CLIENT_NAME_LENGTH, "Client name")
}

/// Partitions are numbered `1..=partition_count`.
pub fn validate_partition(topic: &str, partition: PartitionId, partition_count: u32) -> Result<()> {
    if partition == 0 || partition > partition_count {
        return Err(Error::NotFound(format!(
            "partition {partition} of topic {topic} (has {partition_count})"
        )));
    }
    Ok(())
}

fn validate_identifier(value: &str, max_len: usize, field_name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{field_name} cannot be empty")));
    }

    if value.len() > max_len {
        return Err(Error::InvalidArgument(format!(
            "{field_name} is too long ({} chars, max {max_len} chars)",
            value.len()
        )));
    }

    if value == "." || value == ".." {
        return Err(Error::InvalidArgument(format!(
            "{field_name} cannot be '.' or '..'"
        )));
    }

    if value.starts_with('-') {
        return Err(Error::InvalidArgument(format!(
            "{field_name} '{value}' cannot start with a hyphen"
        )));
    }

    for (i, c) in value.chars().enumerate() {
        let is_valid = c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';
        if !is_valid {
            return Err(Error::InvalidArgument(format!(
                "Invalid character '{}' in {field_name} at position {i}. \
                 Only ASCII letters, digits, '.', '_', and '-' are allowed.",
                c.escape_default()
            )));
        }
    }

    Ok(())
}
