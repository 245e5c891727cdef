//! Search form state: the current query, accumulated results and the
//! continuation token used by "load more".

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::model::Business;
use crate::places::{PlacesService, SearchError, SearchQuery};
use crate::usage::UsageCounter;

pub struct SearchSession {
    places: Arc<dyn PlacesService>,
    counter: Option<UsageCounter>,
    query: Option<SearchQuery>,
    results: Vec<Business>,
    seen: HashSet<String>,
    next_page: Option<String>,
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("query", &self.query)
            .field("results", &self.results.len())
            .field("has_more", &self.next_page.is_some())
            .finish_non_exhaustive()
    }
}

impl SearchSession {
    pub fn new(places: Arc<dyn PlacesService>) -> Self {
        Self {
            places,
            counter: None,
            query: None,
            results: Vec::new(),
            seen: HashSet::new(),
            next_page: None,
        }
    }

    /// Count every successful API call with `counter`.
    pub fn with_counter(mut self, counter: UsageCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn query(&self) -> Option<&SearchQuery> {
        self.query.as_ref()
    }

    pub fn results(&self) -> &[Business] {
        &self.results
    }

    pub fn has_more(&self) -> bool {
        self.next_page.is_some()
    }

    /// Start a new search, discarding previous results.
    pub async fn search(&mut self, query: SearchQuery) -> Result<&[Business], SearchError> {
        self.query = None;
        self.results.clear();
        self.seen.clear();
        self.next_page = None;

        let page = self.places.search(&query, None).await?;
        self.count_call();
        self.query = Some(query);
        self.next_page = page.next_page_token;
        self.append(page.businesses);
        Ok(&self.results)
    }

    /// Fetch the next page. Returns how many new businesses were appended;
    /// zero when there is nothing more to load.
    pub async fn load_more(&mut self) -> Result<usize, SearchError> {
        let (Some(query), Some(token)) = (&self.query, &self.next_page) else {
            return Ok(0);
        };
        let page = self.places.search(query, Some(token.as_str())).await?;
        self.count_call();
        self.next_page = page.next_page_token;
        Ok(self.append(page.businesses))
    }

    fn append(&mut self, businesses: Vec<Business>) -> usize {
        let before = self.results.len();
        for business in businesses {
            if !business.id.is_empty() && !self.seen.insert(business.id.clone()) {
                warn!(id = %business.id, "duplicate business across pages dropped");
                continue;
            }
            self.results.push(business);
        }
        let added = self.results.len() - before;
        info!(added, total = self.results.len(), more = self.has_more(), "results updated");
        added
    }

    fn count_call(&self) {
        if let Some(counter) = &self.counter {
            if let Err(err) = counter.increment() {
                warn!(%err, "failed to record search in usage counter");
            }
        }
    }
}
