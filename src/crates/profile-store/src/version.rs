//! Paged iteration over a key's version history

use crate::{
    backend::{SortDirection, VersionInfo, VersionListRequest},
    error::Result,
    profile::Profile,
    store::ProfileStore,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

const VERSION_PAGE_SIZE: usize = 32;

/// Cursor over the stored versions of one key.
///
/// Pages are fetched lazily; each call to [`VersionQuery::next`] loads one
/// version as a snapshot profile. A snapshot can be written back with
/// [`Profile::overwrite`] to roll the key back to it.
#[derive(Debug)]
pub struct VersionQuery {
    store: ProfileStore,
    key: String,
    request: VersionListRequest,
    buffered: VecDeque<VersionInfo>,
    exhausted: bool,
}

impl VersionQuery {
    pub(crate) fn new(
        store: ProfileStore,
        key: String,
        direction: SortDirection,
        min_date: Option<DateTime<Utc>>,
        max_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            store,
            key,
            request: VersionListRequest {
                direction,
                min_date,
                max_date,
                cursor: None,
                page_size: VERSION_PAGE_SIZE,
            },
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next version in the requested order, `None` when there are no more
    pub async fn next(&mut self) -> Result<Option<Profile>> {
        loop {
            if let Some(info) = self.buffered.pop_front() {
                let stored = self
                    .store
                    .gateway()
                    .get_version(&self.key, &info.version)
                    .await?;
                // Versions can disappear between listing and reading
                match stored {
                    Some(stored) => {
                        return Ok(Some(self.store.snapshot(
                            &self.key,
                            stored.value,
                            Some(stored.key_info),
                        )))
                    }
                    None => continue,
                }
            }

            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .store
                .gateway()
                .list_versions(&self.key, &self.request)
                .await?;
            self.buffered.extend(page.versions);
            self.exhausted = page.next_cursor.is_none();
            self.request.cursor = page.next_cursor;
        }
    }
}
