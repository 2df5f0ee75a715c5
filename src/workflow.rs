//! The scripted update workflow: authentication, then four ordered steps per
//! hostname (search, open record, set Facility type, save), each with its own
//! bounded wait and fallback chain. One item failing never stops the run.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserSession, POLL_INTERVAL};
use crate::config::Config;
use crate::report::Outcome;

/// Floor applied to the explicit wait for the slow post-search steps.
const STEP_WAIT_FLOOR_S: u64 = 45;
/// Pause between processed items.
const ITEM_PAUSE: Duration = Duration::from_millis(400);
/// Settle delay after a save is issued.
const SAVE_SETTLE: Duration = Duration::from_secs(1);

const READY_STATE_COMPLETE: &str = "document.readyState === 'complete'";

/// Results list, record form or main frame: any of these means the search
/// landed somewhere useful.
const SEARCH_LANDED: &str =
    "!!document.querySelector('table.list_table, .list2_body, form, #gsft_main')";

fn step_wait(cfg: &Config) -> Duration {
    Duration::from_secs(cfg.explicit_wait_s.max(STEP_WAIT_FLOOR_S))
}

/// Base64-encode text for embedding in an injected script. The script decodes
/// it with TextDecoder, so quoting and non-ASCII never break the JS.
fn js_b64(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text)
}

/// Splice a base64 payload into a script template at `__B64__`.
fn inject(template: &str, text: &str) -> String {
    template.replace("__B64__", &js_b64(text))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

const LOGIN_FORM_PRESENT: &str = "!!document.getElementById('user_name')";

const FILL_LOGIN_FORM: &str = r#"
    (function() {
        const dec = (b) => new TextDecoder().decode(Uint8Array.from(atob(b), c => c.charCodeAt(0)));
        const user = document.getElementById('user_name');
        const pass = document.getElementById('user_password');
        const btn = document.getElementById('sysverb_login');
        if (!user || !pass || !btn) return false;
        user.value = dec("__USER_B64__");
        user.dispatchEvent(new Event('input', { bubbles: true }));
        pass.value = dec("__PASS_B64__");
        pass.dispatchEvent(new Event('input', { bubbles: true }));
        btn.click();
        return true;
    })()
"#;

/// Navigate to the instance and complete the classic login form if one shows
/// up; otherwise assume SSO already authenticated the session. Intentionally
/// best-effort: no success signal is returned.
pub async fn login(session: &BrowserSession, cfg: &Config) -> Result<(), BrowserError> {
    session.navigate(&cfg.instance_url).await?;
    tokio::time::sleep(Duration::from_secs(cfg.implicit_wait_s)).await;

    if cfg.sso_mode {
        prompt_for_sso().await?;
    }

    // The page may keep loading long after an SSO redirect; don't fail on it.
    if let Err(e) = session
        .wait_for(READY_STATE_COMPLETE, Duration::from_secs(60), "page load")
        .await
    {
        warn!("Page readiness wait skipped: {}", e);
    }

    let form_present = session
        .wait_for(LOGIN_FORM_PRESENT, Duration::from_secs(5), "login form")
        .await
        .is_ok();
    if !form_present {
        info!("No classic login form detected, assuming SSO session");
        return Ok(());
    }

    if cfg.username.is_empty() || cfg.password.is_empty() {
        info!("Login form present but no credentials configured, leaving it to the operator");
        return Ok(());
    }

    let script = FILL_LOGIN_FORM
        .replace("__USER_B64__", &js_b64(&cfg.username))
        .replace("__PASS_B64__", &js_b64(&cfg.password));
    session.execute_js(&script).await?;
    info!("Submitted classic login form");

    if let Err(e) = session
        .wait_for(READY_STATE_COMPLETE, Duration::from_secs(60), "post-login load")
        .await
    {
        warn!("Post-login readiness wait skipped: {}", e);
    }
    Ok(())
}

/// SSO/MFA happens in the browser window; block until the operator confirms.
async fn prompt_for_sso() -> Result<(), BrowserError> {
    println!("Complete the SSO/MFA login in Chrome, then press ENTER to continue...");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 1: search
// ---------------------------------------------------------------------------

/// Focus the global search box by coordinates, type the identifier and
/// submit, then wait for the result page.
async fn search_value(
    session: &BrowserSession,
    cfg: &Config,
    value: &str,
) -> Result<(), BrowserError> {
    if cfg.wait_before_search_s > 0 {
        tokio::time::sleep(Duration::from_secs(cfg.wait_before_search_s)).await;
    }

    if let Err(e) = session
        .wait_for(READY_STATE_COMPLETE, Duration::from_secs(60), "page load")
        .await
    {
        warn!("Pre-search readiness wait skipped: {}", e);
    }

    if !cfg.use_coordinate_search {
        return Err(BrowserError::ElementNotFound(
            "USE_COORDINATE_SEARCH is disabled; enable it to focus the search box by coordinates"
                .into(),
        ));
    }
    if cfg.search_click_x <= 0 || cfg.search_click_y <= 0 {
        return Err(BrowserError::ElementNotFound(
            "SEARCH_CLICK_X and SEARCH_CLICK_Y must be set to focus the search box".into(),
        ));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    session.click_at(cfg.search_click_x, cfg.search_click_y).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.select_all_focused().await?;
    session.type_text(value).await?;
    session.press_enter().await?;

    // Brief transition before the result wait kicks in.
    tokio::time::sleep(Duration::from_secs(1)).await;
    session
        .wait_for(SEARCH_LANDED, step_wait(cfg), "search results")
        .await
}

// ---------------------------------------------------------------------------
// Step 2: open record
// ---------------------------------------------------------------------------

/// Finds a link whose exact visible text matches the value and clicks it.
const CLICK_EXACT_LINK: &str = r#"
    (function() {
        const dec = (b) => new TextDecoder().decode(Uint8Array.from(atob(b), c => c.charCodeAt(0)));
        const value = dec("__B64__");
        const hit = Array.from(document.querySelectorAll('a'))
            .find(a => (a.textContent || '').trim() === value);
        if (!hit) return false;
        hit.click();
        return true;
    })()
"#;

/// Finds a table cell with the exact value and clicks the first visible link
/// in its row.
const CLICK_ROW_LINK: &str = r#"
    (function() {
        const dec = (b) => new TextDecoder().decode(Uint8Array.from(atob(b), c => c.charCodeAt(0)));
        const value = dec("__B64__");
        const cell = Array.from(document.querySelectorAll('td'))
            .find(td => (td.textContent || '').trim() === value);
        if (!cell) return false;
        const row = cell.closest('tr');
        if (!row) return false;
        const link = Array.from(row.querySelectorAll('a'))
            .find(a => a.getAttribute('aria-hidden') !== 'true');
        if (!link) return false;
        link.click();
        return true;
    })()
"#;

const FORM_PRESENT: &str = "!!document.querySelector('form')";

/// Ordered fallbacks for reaching the record form after a search.
#[derive(Debug, Clone, Copy)]
enum OpenStrategy {
    /// A hyperlink whose exact visible text matches the identifier.
    ExactLink,
    /// A cell with exact matching text, then the first link in that row.
    RowLink,
    /// The search dropped us straight onto a form.
    FormPresent,
}

impl OpenStrategy {
    const ALL: [OpenStrategy; 3] = [Self::ExactLink, Self::RowLink, Self::FormPresent];
}

async fn open_record(
    session: &BrowserSession,
    cfg: &Config,
    value: &str,
) -> Result<(), BrowserError> {
    let wait = step_wait(cfg);
    for strategy in OpenStrategy::ALL {
        let attempt = match strategy {
            OpenStrategy::ExactLink => {
                session
                    .wait_for(&inject(CLICK_EXACT_LINK, value), wait, "record link")
                    .await
            }
            OpenStrategy::RowLink => {
                session
                    .wait_for(&inject(CLICK_ROW_LINK, value), wait, "record row")
                    .await
            }
            OpenStrategy::FormPresent => {
                session.wait_for(FORM_PRESENT, wait, "record form").await
            }
        };
        match attempt {
            Ok(()) => {
                debug!("Opened record for '{}' via {:?}", value, strategy);
                return Ok(());
            }
            Err(BrowserError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(BrowserError::ElementNotFound(format!(
        "cannot open record for '{}'",
        value
    )))
}

// ---------------------------------------------------------------------------
// Step 3: set the Facility type field
// ---------------------------------------------------------------------------

/// Locates the field and writes the value in one shot. Returns a JSON object:
/// `found` (element located), `ok` (value applied), `isSelect`, `error`.
/// `__FINDER__` is replaced with strategy-specific lookup code that leaves
/// the target in `el`.
const SET_FIELD_TEMPLATE: &str = r#"
    (function() {
        const dec = (b) => new TextDecoder().decode(Uint8Array.from(atob(b), c => c.charCodeAt(0)));
        const value = dec("__B64__");
        __FINDER__
        if (!el) return { found: false };
        if (el.tagName.toLowerCase() === 'select') {
            const opt = Array.from(el.options)
                .find(o => (o.textContent || '').trim() === value);
            if (!opt) return { found: true, ok: false, error: 'option not found: ' + value };
            el.value = opt.value;
            el.dispatchEvent(new Event('change', { bubbles: true }));
            return { found: true, ok: true, isSelect: true };
        }
        el.focus();
        el.value = '';
        el.value = value;
        el.dispatchEvent(new Event('input', { bubbles: true }));
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return { found: true, ok: true, isSelect: false };
    })()
"#;

/// The field's fixed element id on the computer CI form.
const FIELD_BY_ID: &str =
    "const el = document.getElementById('cmdb_ci_computer.u_facility_type');";

/// Label-based fallback: find the "Facility type" label, walk up to its
/// containing block, take the first editable control inside.
const FIELD_BY_LABEL: &str = r#"
        const label = Array.from(document.querySelectorAll('label'))
            .find(l => (l.textContent || '').includes('Facility type'));
        const container = label ? label.closest('div, td') : null;
        const el = container ? container.querySelector('select, input, textarea') : null;
"#;

#[derive(Debug, Clone, Copy)]
enum FieldStrategy {
    KnownId,
    LabelWalk,
}

impl FieldStrategy {
    const ALL: [FieldStrategy; 2] = [Self::KnownId, Self::LabelWalk];

    fn finder(self) -> &'static str {
        match self {
            FieldStrategy::KnownId => FIELD_BY_ID,
            FieldStrategy::LabelWalk => FIELD_BY_LABEL,
        }
    }
}

/// Only a locate timeout moves on to the next finder. A field that was
/// located but rejected the value (a select without the option) is a hard
/// error, as is any session failure.
fn try_next_finder(e: &BrowserError) -> bool {
    matches!(e, BrowserError::Timeout(_))
}

async fn set_facility_type(session: &BrowserSession, cfg: &Config) -> Result<(), BrowserError> {
    let wait = step_wait(cfg);
    let mut last_err: Option<BrowserError> = None;

    for strategy in FieldStrategy::ALL {
        let script = SET_FIELD_TEMPLATE
            .replace("__FINDER__", strategy.finder())
            .replace("__B64__", &js_b64(&cfg.facility_type_text));

        match apply_field_script(session, &script, wait).await {
            Ok(is_select) => {
                if !is_select {
                    // Text fields commit on blur.
                    session.press_tab().await?;
                }
                debug!("Facility type set via {:?}", strategy);
                return Ok(());
            }
            Err(e) if try_next_finder(&e) => {
                debug!("Field strategy {:?} failed: {}", strategy, e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    let cause = last_err.map(|e| e.to_string()).unwrap_or_default();
    Err(BrowserError::ElementNotFound(format!(
        "could not locate or set Facility type: {}",
        cause
    )))
}

/// Polls the set-field script until the element is found, then checks the
/// application result. Returns whether the field was a selection control.
async fn apply_field_script(
    session: &BrowserSession,
    script: &str,
    timeout: Duration,
) -> Result<bool, BrowserError> {
    let deadline = Instant::now() + timeout;
    loop {
        let result = session.execute_js_with_timeout(script, 10).await?;
        if result.get("found").and_then(|v| v.as_bool()) == Some(true) {
            if result.get("ok").and_then(|v| v.as_bool()) == Some(true) {
                return Ok(result.get("isSelect").and_then(|v| v.as_bool()) == Some(true));
            }
            let error = result
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("could not apply field value");
            return Err(BrowserError::JavaScriptError(error.to_string()));
        }
        if Instant::now() >= deadline {
            return Err(BrowserError::Timeout(
                "timed out waiting for the Facility type field".into(),
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// ---------------------------------------------------------------------------
// Step 4: save
// ---------------------------------------------------------------------------

/// Known Save/Update button ids, tried in order.
const SAVE_BUTTON_IDS: [&str; 4] = [
    "sysverb_save",
    "sysverb_update",
    "save_button",
    "update_button",
];

/// A button whose visible text is exactly Save or Update.
const CLICK_SAVE_BY_TEXT: &str = r#"
    (function() {
        const btn = Array.from(document.querySelectorAll('button')).find(b => {
            const t = (b.textContent || '').trim();
            return t === 'Save' || t === 'Update';
        });
        if (!btn) return false;
        btn.click();
        return true;
    })()
"#;

/// Opens the More/Actions overflow button if one exists.
const OPEN_ACTIONS_MENU: &str = r#"
    (function() {
        const btn = Array.from(document.querySelectorAll('button')).find(b => {
            const label = b.getAttribute('aria-label') || '';
            const text = b.textContent || '';
            return label.includes('More')
                || (b.className.includes('btn') && (text.includes('More') || text.includes('Actions')));
        });
        if (!btn) return false;
        btn.click();
        return true;
    })()
"#;

/// Clicks a Save/Update entry inside any rendered menu.
const CLICK_MENU_SAVE_OR_UPDATE: &str = r#"
    (function() {
        const menus = document.querySelectorAll('[class*="menu"], [role*="menu"]');
        for (const menu of menus) {
            const item = Array.from(menu.querySelectorAll('*')).find(el => {
                const t = (el.textContent || '').trim();
                return t === 'Save' || t === 'Update';
            });
            if (item) { item.click(); return true; }
        }
        return false;
    })()
"#;

/// Clicks a Save entry inside any rendered menu (context-menu variant).
const CLICK_MENU_SAVE: &str = r#"
    (function() {
        const menus = document.querySelectorAll('[class*="menu"], [role*="menu"]');
        for (const menu of menus) {
            const item = Array.from(menu.querySelectorAll('*')).find(el => {
                return (el.textContent || '').trim() === 'Save';
            });
            if (item) { item.click(); return true; }
        }
        return false;
    })()
"#;

/// Ordered fallbacks for committing the record via the DOM.
#[derive(Debug, Clone)]
enum SaveStrategy {
    ById(&'static str),
    ByText,
    OverflowMenu,
}

fn dom_save_strategies() -> Vec<SaveStrategy> {
    SAVE_BUTTON_IDS
        .iter()
        .map(|id| SaveStrategy::ById(id))
        .chain([SaveStrategy::ByText, SaveStrategy::OverflowMenu])
        .collect()
}

async fn save_record(session: &BrowserSession, cfg: &Config) -> Result<(), BrowserError> {
    if cfg.use_coordinate_save {
        save_via_coordinates(session, cfg).await
    } else {
        save_via_dom(session, cfg).await
    }
}

async fn save_via_dom(session: &BrowserSession, cfg: &Config) -> Result<(), BrowserError> {
    let wait = step_wait(cfg);
    for strategy in dom_save_strategies() {
        let attempt = match &strategy {
            SaveStrategy::ById(id) => {
                let script = format!(
                    "(function() {{ const b = document.getElementById('{id}'); \
                     if (!b) return false; b.click(); return true; }})()"
                );
                session.wait_for(&script, wait, "save button").await
            }
            SaveStrategy::ByText => {
                session
                    .wait_for(CLICK_SAVE_BY_TEXT, wait, "Save/Update button")
                    .await
            }
            SaveStrategy::OverflowMenu => save_via_overflow_menu(session, wait).await,
        };
        match attempt {
            Ok(()) => {
                debug!("Record saved via {:?}", strategy);
                return Ok(());
            }
            Err(BrowserError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(BrowserError::ElementNotFound(
        "could not find a Save/Update control via the DOM".into(),
    ))
}

async fn save_via_overflow_menu(
    session: &BrowserSession,
    wait: Duration,
) -> Result<(), BrowserError> {
    session
        .wait_for(OPEN_ACTIONS_MENU, wait, "actions menu button")
        .await?;
    session
        .wait_for(CLICK_MENU_SAVE_OR_UPDATE, wait, "Save entry in actions menu")
        .await
}

/// Right-click the fixed coordinates and pick Save from the context menu,
/// falling back to blind keyboard navigation when the menu markup is not
/// addressable.
async fn save_via_coordinates(
    session: &BrowserSession,
    cfg: &Config,
) -> Result<(), BrowserError> {
    tokio::time::sleep(Duration::from_millis(700)).await;
    session
        .right_click_at(cfg.right_click_x, cfg.right_click_y)
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    match session
        .wait_for(CLICK_MENU_SAVE, step_wait(cfg), "Save entry in context menu")
        .await
    {
        Ok(()) => Ok(()),
        Err(BrowserError::Timeout(_)) => {
            session.press_arrow_down().await?;
            session.press_enter().await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Per-item driver
// ---------------------------------------------------------------------------

async fn run_steps(
    session: &BrowserSession,
    cfg: &Config,
    value: &str,
) -> Result<(), BrowserError> {
    search_value(session, cfg, value).await?;
    open_record(session, cfg, value).await?;
    set_facility_type(session, cfg).await?;
    save_record(session, cfg).await?;
    tokio::time::sleep(SAVE_SETTLE).await;
    Ok(())
}

/// The hostname goes into a file name; keep it path-safe.
fn screenshot_path(value: &str) -> PathBuf {
    let safe: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    PathBuf::from(format!("error_{}.png", safe))
}

/// Run the four steps for one identifier. Errors become an ERROR outcome
/// plus a best-effort screenshot; they never propagate.
pub async fn process_item(session: &BrowserSession, cfg: &Config, value: &str) -> Outcome {
    match run_steps(session, cfg, value).await {
        Ok(()) => Outcome::ok(value, "Atualizado e salvo."),
        Err(e) => {
            let shot = screenshot_path(value);
            if let Err(shot_err) = session.screenshot_to(&shot).await {
                warn!("Could not capture {}: {}", shot.display(), shot_err);
            }
            let detail = match &e {
                BrowserError::Timeout(msg) => format!("Timeout: {}", msg),
                other => other.to_string(),
            };
            Outcome::error(value, detail)
        }
    }
}

/// Process every identifier in order through `item`, collecting exactly one
/// outcome per identifier. Generic over the item function so the loop is
/// testable without a browser.
pub async fn process_all<F, Fut>(values: &[String], mut item: F) -> Vec<Outcome>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let total = values.len();
    let mut outcomes = Vec::with_capacity(total);

    for (i, value) in values.iter().enumerate() {
        info!("[{}/{}] {}", i + 1, total, value);
        let outcome = item(value.clone()).await;
        info!("   -> {}: {}", outcome.status, outcome.detail);
        outcomes.push(outcome);
        tokio::time::sleep(ITEM_PAUSE).await;
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Status;

    #[tokio::test]
    async fn test_one_outcome_per_identifier_in_input_order() {
        let values = vec!["host1".to_string(), "host2".to_string(), "host3".to_string()];
        let outcomes = process_all(&values, |value| async move {
            if value == "host2" {
                Outcome::error(&value, "could not locate or set Facility type".to_string())
            } else {
                Outcome::ok(&value, "Atualizado e salvo.")
            }
        })
        .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].value, "host1");
        assert_eq!(outcomes[0].status, Status::Ok);
        assert_eq!(outcomes[1].value, "host2");
        assert_eq!(outcomes[1].status, Status::Error);
        assert_eq!(outcomes[2].value, "host3");
        assert_eq!(outcomes[2].status, Status::Ok);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_loop() {
        let values = vec!["a".to_string(), "b".to_string()];
        let mut calls = 0u32;
        let outcomes = process_all(&values, |value| {
            calls += 1;
            async move { Outcome::error(&value, "boom".to_string()) }
        })
        .await;

        assert_eq!(calls, 2);
        assert_eq!(outcomes.len(), 2);
    }

    #[test]
    fn test_screenshot_path_is_sanitized() {
        assert_eq!(
            screenshot_path("srv-01.example.com"),
            PathBuf::from("error_srv-01.example.com.png")
        );
        assert_eq!(
            screenshot_path("../etc/passwd"),
            PathBuf::from("error_.._etc_passwd.png")
        );
    }

    #[test]
    fn test_dom_save_strategy_order() {
        let strategies = dom_save_strategies();
        assert_eq!(strategies.len(), 6);
        assert!(matches!(strategies[0], SaveStrategy::ById("sysverb_save")));
        assert!(matches!(strategies[3], SaveStrategy::ById("update_button")));
        assert!(matches!(strategies[4], SaveStrategy::ByText));
        assert!(matches!(strategies[5], SaveStrategy::OverflowMenu));
    }

    #[test]
    fn test_field_fallback_only_covers_locate_timeouts() {
        assert!(try_next_finder(&BrowserError::Timeout(
            "timed out waiting for the Facility type field".to_string()
        )));
        assert!(!try_next_finder(&BrowserError::JavaScriptError(
            "option not found: Plant Location".to_string()
        )));
        assert!(!try_next_finder(&BrowserError::ConnectionLost(
            "handler ended".to_string()
        )));
    }

    #[test]
    fn test_injected_value_is_base64_encoded() {
        let script = inject(CLICK_EXACT_LINK, "host\"1'<>");
        assert!(!script.contains("host\"1'<>"));
        assert!(script.contains(&js_b64("host\"1'<>")));
    }
}
