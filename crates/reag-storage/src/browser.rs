//! Rendered fetch through a headless Chromium (CDP) for client-side rendered sources.
//!
//! Each fetch runs in its own incognito browser context with images, fonts, stylesheets
//! and media blocked. Without the `browser` feature every render is
//! [`FetchError::RenderingUnavailable`].

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::{FetchError, FetchedDocument};

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    /// Navigation timeout per attempt.
    pub timeout: Duration,
    /// Minimum wait after navigation before the document is read.
    pub settle: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            timeout: Duration::from_secs(30),
            settle: Duration::from_millis(1500),
        }
    }
}

#[cfg(feature = "browser")]
const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.woff", "*.woff2",
    "*.ttf", "*.otf", "*.css", "*.mp4", "*.webm", "*.mp3",
];

#[cfg(feature = "browser")]
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

#[cfg(feature = "browser")]
pub struct BrowserFetcher {
    config: BrowserConfig,
    browser: tokio::sync::Mutex<Option<chromiumoxide::Browser>>,
}

#[cfg(feature = "browser")]
impl std::fmt::Debug for BrowserFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserFetcher").field("config", &self.config).finish()
    }
}

#[cfg(feature = "browser")]
impl BrowserFetcher {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        true
    }

    fn chrome_executable(&self) -> Option<PathBuf> {
        self.config.chrome_executable.clone().or_else(|| {
            CHROME_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        })
    }

    async fn launch(&self) -> Result<chromiumoxide::Browser, FetchError> {
        use futures::StreamExt;

        let mut builder = chromiumoxide::BrowserConfig::builder()
            .request_timeout(self.config.timeout)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .arg("--no-sandbox");
        if let Some(path) = self.chrome_executable() {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        let cdp_config = builder.build().map_err(|reason| FetchError::Navigation {
            url: "about:blank".into(),
            reason,
        })?;

        let (browser, mut handler) = chromiumoxide::Browser::launch(cdp_config)
            .await
            .map_err(|e| FetchError::Navigation {
                url: "about:blank".into(),
                reason: format!("launching browser: {e}"),
            })?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        tracing::info!(headless = self.config.headless, "browser launched");
        Ok(browser)
    }

    /// Render `url` in an isolated context and return the settled document.
    pub async fn render(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<FetchedDocument, FetchError> {
        use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
        use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};

        let nav_err = |reason: String| FetchError::Navigation {
            url: url.to_string(),
            reason,
        };

        let (page, context_id) = {
            let mut guard = self.browser.lock().await;
            if guard.is_none() {
                *guard = Some(self.launch().await?);
            }
            let Some(browser) = guard.as_mut() else {
                return Err(nav_err("browser failed to start".to_string()));
            };
            let context_id = browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await
                .map_err(|e| nav_err(format!("creating browser context: {e}")))?;
            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(nav_err)?;
            let page = browser
                .new_page(target)
                .await
                .map_err(|e| nav_err(format!("opening page: {e}")))?;
            (page, context_id)
        };

        let result = async {
            page.execute(EnableParams::default())
                .await
                .map_err(|e| nav_err(format!("enabling network domain: {e}")))?;
            page.execute(SetBlockedUrLsParams::new(
                BLOCKED_RESOURCE_PATTERNS.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            ))
            .await
            .map_err(|e| nav_err(format!("blocking resources: {e}")))?;

            tracing::debug!(%run_id, source_id, url, "navigating");
            tokio::time::timeout(self.config.timeout, page.goto(url))
                .await
                .map_err(|_| FetchError::Timeout {
                    url: url.to_string(),
                    after: self.config.timeout,
                })?
                .map_err(|e| nav_err(e.to_string()))?;

            tokio::time::sleep(self.config.settle).await;

            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());
            let body = page.content().await.map_err(|e| nav_err(format!("reading content: {e}")))?;
            Ok(FetchedDocument {
                status: 200,
                final_url,
                body,
                truncated: false,
            })
        }
        .await;

        let _ = page.close().await;
        if let Some(browser) = self.browser.lock().await.as_mut() {
            let _ = browser.dispose_browser_context(context_id).await;
        }
        result
    }
}

#[cfg(not(feature = "browser"))]
#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    #[allow(dead_code)]
    config: BrowserConfig,
}

#[cfg(not(feature = "browser"))]
impl BrowserFetcher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    pub fn is_available(&self) -> bool {
        false
    }

    pub async fn render(&self, _run_id: Uuid, _source_id: &str, url: &str) -> Result<FetchedDocument, FetchError> {
        Err(FetchError::RenderingUnavailable { url: url.to_string() })
    }
}

#[cfg(all(test, not(feature = "browser")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn render_without_browser_feature_is_unavailable() {
        let fetcher = BrowserFetcher::new(BrowserConfig::default());
        assert!(!fetcher.is_available());
        let err = fetcher
            .render(Uuid::new_v4(), "99acres", "https://www.99acres.com/")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RenderingUnavailable { .. }));
    }
}
