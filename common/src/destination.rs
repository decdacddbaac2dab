//! The rotating list of transfer destinations.
//!
//! Destinations are `[user@]host:path` strings handed verbatim to the
//! transfer program. The cursor always points at the currently attempted
//! destination and advances only on a collective connection failure; when the
//! list is exhausted it wraps back to the first entry, with the caller
//! sleeping a cooldown before retrying.

use crate::config::Config;

/// An ordered destination list with a rotating cursor.
#[derive(Debug)]
pub struct DestinationList {
    entries: Vec<String>,
    cursor: usize,
}

impl DestinationList {
    /// Build from the config: the explicit `destinations` list when present,
    /// otherwise a single destination composed from the remote user, host and
    /// directory fields. The composed destination may be empty (purely local
    /// transfer), in which case [`DestinationList::current`] yields `None`.
    #[must_use]
    pub fn from_config(config: &Config) -> DestinationList {
        let mut entries: Vec<String> = config
            .destinations
            .iter()
            .filter(|d| !d.is_empty())
            .cloned()
            .collect();
        if entries.is_empty() {
            entries.push(compose(
                &config.remote_user,
                &config.remote_host,
                &config.remote_directory,
            ));
        }
        DestinationList { entries, cursor: 0 }
    }

    /// The currently attempted destination, or `None` when transfers are
    /// purely local and no destination argument should be passed.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        let entry = self.entries[self.cursor].as_str();
        if entry.is_empty() { None } else { Some(entry) }
    }

    /// Move the cursor to the next destination. Returns true when the list
    /// wrapped around to the first entry.
    pub fn advance(&mut self) -> bool {
        self.cursor = (self.cursor + 1) % self.entries.len();
        self.cursor == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `[user@]host:path`, omitting the pieces that are not configured.
#[must_use]
pub fn compose(remote_user: &str, remote_host: &str, remote_directory: &str) -> String {
    let mut destination = remote_directory.to_string();
    if !remote_host.is_empty() {
        destination = format!("{remote_host}:{destination}");
        if !remote_user.is_empty() {
            destination = format!("{remote_user}@{destination}");
        }
    }
    destination
}
