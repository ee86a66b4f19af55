//! Paginated enumeration of every database name in the cluster.

use crate::connection::ClusterSession;
use crate::core::{ClusterError, Result};
use futures::Stream;
use std::collections::VecDeque;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Appended to the last key of a page to build the next `start_key`.
///
/// `\u{0}` would be the natural successor but the store rejects it. A space
/// sorts after the key itself and before every character a database name
/// may contain.
pub const KEY_SUCCESSOR_SUFFIX: char = ' ';

fn successor(key: &str) -> String {
    let mut next = String::with_capacity(key.len() + 1);
    next.push_str(key);
    next.push(KEY_SUCCESSOR_SUFFIX);
    next
}

/// Lazy, finite, forward-only sequence of database names
///
/// Names come back in the store's collation order, unfiltered. Once the
/// sequence has ended, or a page request has failed, it yields nothing more:
/// start a new enumerator to enumerate again.
pub struct KeyEnumerator<S> {
    session: S,
    page_size: usize,
    last_key: Option<String>,
    page: VecDeque<String>,
    exhausted: bool,
}

impl<S: ClusterSession> KeyEnumerator<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            page_size: DEFAULT_PAGE_SIZE,
            last_key: None,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.page.is_empty()
    }

    /// Next name, fetching a new page when the buffered one is used up.
    pub async fn next_key(&mut self) -> Result<Option<String>> {
        if let Some(key) = self.page.pop_front() {
            return Ok(Some(key));
        }
        if self.exhausted {
            return Ok(None);
        }

        let start_key = self.last_key.as_deref().map(successor);
        let keys = match self
            .session
            .list_databases(start_key.as_deref(), self.page_size)
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                self.exhausted = true;
                return Err(err);
            }
        };

        if keys.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        self.last_key = keys.last().cloned();
        self.page = keys.into();
        Ok(self.page.pop_front())
    }

    /// Turns the enumerator into a stream that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send + 'static
    where
        S: 'static,
    {
        futures::stream::try_unfold(self, |mut keys| async move {
            Ok::<_, ClusterError>(keys.next_key().await?.map(|key| (key, keys)))
        })
    }

    pub fn into_session(self) -> S {
        self.session
    }
}
