//! 网络访问：`Fetch` 约定与 reqwest 实现。

pub mod network;

#[cfg(test)]
pub(crate) mod testing {
    //! 内存中的 `Fetch` 实现，测试不访问网络。

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::network::{Fetch, FetchError, FetchPolicy};

    #[derive(Default)]
    pub(crate) struct StaticFetcher {
        pages: HashMap<String, Vec<u8>>,
        failing: HashMap<String, u16>,
        hits: Mutex<HashMap<String, usize>>,
    }

    impl StaticFetcher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_page(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.pages.insert(url.to_string(), body.into());
            self
        }

        pub(crate) fn with_failure(mut self, url: &str, status: u16) -> Self {
            self.failing.insert(url.to_string(), status);
            self
        }

        pub(crate) fn hits(&self, url: &str) -> usize {
            self.hits
                .lock()
                .map(|h| h.get(url).copied().unwrap_or(0))
                .unwrap_or(0)
        }
    }

    impl Fetch for StaticFetcher {
        fn fetch(&self, url: &str, _policy: &FetchPolicy) -> Result<Vec<u8>, FetchError> {
            if let Ok(mut hits) = self.hits.lock() {
                *hits.entry(url.to_string()).or_insert(0) += 1;
            }
            if let Some(status) = self.failing.get(url) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: *status,
                });
            }
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                })
        }
    }
}
