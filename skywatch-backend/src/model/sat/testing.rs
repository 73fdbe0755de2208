///! Fixtures and fakes shared by the unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::api_client::CatalogFetcher;
use crate::error::FetchError;

pub const ELEMENTS_URL: &str = "https://catalog.test/elements.txt";
pub const METADATA_URL: &str = "https://catalog.test/elements.xml";

pub const CALSPHERE_1: &str = "CALSPHERE 1
1 00900U 64063C   20178.87487168  .00000295  00000-0  30246-3 0  9999
2 00900  90.1581  24.6856 0026392 224.5302 233.0484 13.73370980768855";

pub const NAVSTAR_56: &str = "NAVSTAR 56
1 28874U 05038A   20178.51806582 -.00000076  00000-0  00000+0 0  9991
2 28874  55.4918 124.9576 0124536 241.6296 117.2213  2.00563786108876";

pub const CALSPHERE_2: &str = "CALSPHERE 2
1 00902U 64063E   20178.84423413  .00000331  00000-0  34019-3 0  9994
2 00902  90.1605  28.4632 0019524 262.0455 254.7853 13.52695340560041";

pub fn catalog_text() -> String {
    format!("{}\n{}\n{}\n", CALSPHERE_1, NAVSTAR_56, CALSPHERE_2)
}

/// Canned responses per URL, with a call counter and optional latency
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, Result<String, String>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serving(url: &str, body: impl Into<String>) -> Self {
        let fetcher = Self::new();
        fetcher.respond(url, body);
        fetcher
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, url: &str, body: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.into()));
    }

    pub fn fail(&self, url: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err("connection refused".to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogFetcher for FakeFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.responses.lock().unwrap().get(url).cloned();
        match response {
            Some(Ok(body)) => Ok(body),
            Some(Err(last_error)) => Err(FetchError::NoConnectivity {
                url: url.to_string(),
                attempts: 5,
                last_error,
            }),
            None => Err(FetchError::NoConnectivity {
                url: url.to_string(),
                attempts: 5,
                last_error: "no canned response".to_string(),
            }),
        }
    }
}
