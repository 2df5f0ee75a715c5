//! Browser session management
//!
//! Launches and controls the single Chrome instance for the run. All
//! interaction goes through the DevTools protocol: script evaluation for DOM
//! work, `Input.dispatchMouseEvent` / `Input.dispatchKeyEvent` for the
//! coordinate modes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::BrowserError;
use crate::config::Config;

/// Interval between attempts when polling for a page condition.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The live browser session. Owned by the top-level driver for the whole
/// run and closed exactly once via [`BrowserSession::close`].
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
    /// Set by the handler task when the CDP event stream ends.
    disconnected: Arc<AtomicBool>,
}

/// Classify an evaluation failure. Once the event handler has ended the
/// browser is gone and every evaluation fails; report the connection, not
/// the script.
fn eval_error(disconnected: bool, message: String) -> BrowserError {
    if disconnected {
        BrowserError::ConnectionLost(message)
    } else {
        BrowserError::JavaScriptError(message)
    }
}

impl BrowserSession {
    /// Launch Chrome with the configured window geometry, optional isolated
    /// profile and optional custom binary. Launch failures are fatal.
    pub async fn launch(cfg: &Config) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .with_head()
            .window_size(cfg.window_width, cfg.window_height)
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-default-browser-check")
            .arg("--window-position=100,100");

        if cfg.use_isolated_profile {
            // Keeps cookies/login without touching the user's default Chrome.
            let profile_dir = std::env::current_dir()?.join("chrome-profile");
            std::fs::create_dir_all(&profile_dir)?;
            builder = builder.user_data_dir(&profile_dir);
        }

        if let Some(ref binary) = cfg.chrome_binary {
            let path = if binary.is_absolute() {
                binary.clone()
            } else {
                std::env::current_dir()?.join(binary)
            };
            if !path.exists() {
                return Err(BrowserError::LaunchFailed(format!(
                    "Chrome binary not found at: {}",
                    path.display()
                )));
            }
            builder = builder.chrome_executable(path);
        }

        let browser_config = builder.build().map_err(BrowserError::LaunchFailed)?;

        info!(
            "Launching browser ({}x{})",
            cfg.window_width, cfg.window_height
        );
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, Chrome has disconnected or crashed.
        let disconnected = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&disconnected);
        let handler_task = tokio::spawn(async move {
            while handler.next().await.is_some() {}
            handler_flag.store(true, Ordering::SeqCst);
            warn!("Chrome disconnected (event handler ended)");
        });

        // Chrome opens with a blank tab; take it over and close any extras.
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?
            };

            for extra in pages {
                debug!("Closing extra blank tab");
                let _ = extra.close().await;
            }

            main_page
        };

        Ok(Self {
            browser,
            page,
            handler_task,
            disconnected,
        })
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        debug!("Navigating to: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    /// Execute JavaScript on the page with the default 60 second timeout.
    pub async fn execute_js(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.execute_js_with_timeout(script, 60).await
    }

    /// Execute JavaScript on the page with a custom timeout (in seconds).
    pub async fn execute_js_with_timeout(
        &self,
        script: &str,
        timeout_secs: u64,
    ) -> Result<serde_json::Value, BrowserError> {
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.page.evaluate(script),
        )
        .await
        .map_err(|_| {
            BrowserError::Timeout(format!(
                "JavaScript execution timed out after {}s",
                timeout_secs
            ))
        })?
        .map_err(|e| eval_error(self.disconnected.load(Ordering::SeqCst), e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Poll a JavaScript expression until it evaluates to `true` or the
    /// deadline passes. Scripts may have side effects (find-and-click
    /// attempts), so a strategy chain can retry them safely.
    pub async fn wait_for(
        &self,
        script: &str,
        timeout: Duration,
        what: &str,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.execute_js_with_timeout(script, 10).await {
                Ok(value) if value.as_bool() == Some(true) => return Ok(()),
                Ok(_) => {}
                // A slow evaluation does not end the wait, and neither does a
                // script failure: mid-navigation the page context comes and
                // goes, so evaluation errors here are usually transient.
                Err(BrowserError::Timeout(_)) => {}
                Err(BrowserError::JavaScriptError(e)) => {
                    debug!("Wait predicate for {} not evaluable yet: {}", what, e);
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(format!(
                    "timed out waiting for {}",
                    what
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Left-click at viewport coordinates.
    pub async fn click_at(&self, x: i64, y: i64) -> Result<(), BrowserError> {
        self.mouse_click(x, y, MouseButton::Left).await
    }

    /// Right-click at viewport coordinates (opens the context menu).
    pub async fn right_click_at(&self, x: i64, y: i64) -> Result<(), BrowserError> {
        self.mouse_click(x, y, MouseButton::Right).await
    }

    async fn mouse_click(
        &self,
        x: i64,
        y: i64,
        button: MouseButton,
    ) -> Result<(), BrowserError> {
        let (x, y) = (x as f64, y as f64);
        let mut rng = rand::rngs::StdRng::from_entropy();

        let moved = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .button(MouseButton::None)
            .build()
            .unwrap();
        self.page
            .execute(moved)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP mouseMove failed: {}", e)))?;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(50..150))).await;

        let mouse_down = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(button.clone())
            .click_count(1)
            .build()
            .unwrap();
        self.page
            .execute(mouse_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP mouseDown failed: {}", e)))?;

        tokio::time::sleep(Duration::from_millis(rng.gen_range(40..120))).await;

        let mouse_up = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(button)
            .click_count(1)
            .build()
            .unwrap();
        self.page
            .execute(mouse_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP mouseUp failed: {}", e)))?;

        Ok(())
    }

    /// Select the contents of the currently focused input so the next
    /// keystrokes replace it.
    pub async fn select_all_focused(&self) -> Result<(), BrowserError> {
        self.execute_js(
            r#"
            (function() {
                const el = document.activeElement;
                if (el && typeof el.select === 'function') { el.select(); return true; }
                if (el && el.isContentEditable) { document.execCommand('selectAll'); return true; }
                return false;
            })()
        "#,
        )
        .await?;
        Ok(())
    }

    /// Type text into the currently focused element using raw CDP keyboard
    /// events, with a small per-keystroke delay.
    pub async fn type_text(&self, text: &str) -> Result<(), BrowserError> {
        let mut rng = rand::rngs::StdRng::from_entropy();

        for c in text.chars() {
            let key_down = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyDown)
                .text(c.to_string())
                .build()
                .unwrap();
            self.page
                .execute(key_down)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("CDP keyDown failed: {}", e)))?;

            let key_up = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyUp)
                .build()
                .unwrap();
            self.page
                .execute(key_up)
                .await
                .map_err(|e| BrowserError::JavaScriptError(format!("CDP keyUp failed: {}", e)))?;

            let delay = rng.gen_range(20..60);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        Ok(())
    }

    /// Press Enter. The char event with `\r` is what triggers form
    /// submission in most pages.
    pub async fn press_enter(&self) -> Result<(), BrowserError> {
        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .unwrap();
        self.page
            .execute(key_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter keyDown failed: {}", e)))?;

        let char_event = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text("\r")
            .build()
            .unwrap();
        self.page
            .execute(char_event)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter char failed: {}", e)))?;

        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .unwrap();
        self.page
            .execute(key_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter keyUp failed: {}", e)))?;

        Ok(())
    }

    /// Press Tab (commits a typed field value by blurring it).
    pub async fn press_tab(&self) -> Result<(), BrowserError> {
        self.press_named_key("Tab", 9).await
    }

    /// Press ArrowDown (context-menu fallback navigation).
    pub async fn press_arrow_down(&self) -> Result<(), BrowserError> {
        self.press_named_key("ArrowDown", 40).await
    }

    async fn press_named_key(&self, key: &str, key_code: i64) -> Result<(), BrowserError> {
        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key(key)
            .code(key)
            .windows_virtual_key_code(key_code)
            .native_virtual_key_code(key_code)
            .build()
            .unwrap();
        self.page
            .execute(key_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP {key} keyDown failed: {e}")))?;

        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .code(key)
            .windows_virtual_key_code(key_code)
            .native_virtual_key_code(key_code)
            .build()
            .unwrap();
        self.page
            .execute(key_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP {key} keyUp failed: {e}")))?;

        Ok(())
    }

    /// Capture a viewport screenshot as PNG to the given path.
    pub async fn screenshot_to(&self, path: &Path) -> Result<(), BrowserError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        let data = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("screenshot failed: {}", e)))?;
        tokio::fs::write(path, &data).await?;
        debug!("Screenshot saved to: {}", path.display());
        Ok(())
    }

    /// Close the browser. Errors are logged, not propagated: teardown must
    /// not mask the run's result.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = self.handler_task.await;
        info!("Browser session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_missing_chrome_binary_fails_before_launch() {
        let cfg = Config::from_lookup(|key| match key {
            "INSTANCE_URL" => Some("https://example.service-now.com".to_string()),
            "CHROME_BINARY" => Some("no-such-chrome-binary".to_string()),
            "USE_ISOLATED_PROFILE" => Some("false".to_string()),
            _ => None,
        })
        .unwrap();

        match BrowserSession::launch(&cfg).await {
            Err(BrowserError::LaunchFailed(msg)) => {
                assert!(msg.contains("no-such-chrome-binary"), "got: {msg}");
            }
            Err(other) => panic!("expected LaunchFailed, got {other}"),
            Ok(_) => panic!("launch should fail without the configured binary"),
        }
    }

    #[test]
    fn test_eval_failure_after_disconnect_reports_the_connection() {
        assert!(matches!(
            eval_error(true, "boom".to_string()),
            BrowserError::ConnectionLost(_)
        ));
        assert!(matches!(
            eval_error(false, "boom".to_string()),
            BrowserError::JavaScriptError(_)
        ));
    }
}
