//! Environment-driven configuration.
//!
//! Every setting comes from an environment variable (a `.env` file in the
//! working directory is loaded first, best effort). The configuration is
//! built once at startup and passed by reference everywhere else.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use url::Url;

/// Default spreadsheet file when `EXCEL_PATH` is unset.
pub const DEFAULT_EXCEL_PATH: &str = "Inventario_RAD.xlsx";
/// Default worksheet name when `EXCEL_SHEET` is unset.
pub const DEFAULT_EXCEL_SHEET: &str = "INVENTARIO RAD";
/// Default identifier column when `EXCEL_COLUMN` is unset.
pub const DEFAULT_EXCEL_COLUMN: &str = "HOSTNAME";
/// Default value written into the Facility type field.
pub const DEFAULT_FACILITY_TYPE: &str = "Plant Location";

/// All runtime settings. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target ServiceNow instance URL.
    pub instance_url: String,
    /// Classic login credentials; empty when SSO handles authentication.
    pub username: String,
    pub password: String,

    /// Spreadsheet path, worksheet name and identifier column header.
    pub excel_path: PathBuf,
    pub excel_sheet: String,
    pub excel_column: String,
    /// Cap on the number of identifiers to process (`MAX_ROWS`, 0 = unlimited).
    pub max_rows: Option<usize>,

    /// Text written into the Facility type field.
    pub facility_type_text: String,

    /// Save via a right-click context menu at fixed viewport coordinates
    /// instead of the DOM button chain.
    pub use_coordinate_save: bool,
    pub right_click_x: i64,
    pub right_click_y: i64,

    /// Focus the global search box by clicking fixed viewport coordinates.
    pub use_coordinate_search: bool,
    pub search_click_x: i64,
    pub search_click_y: i64,

    /// Settle delay applied right after the initial navigation.
    pub implicit_wait_s: u64,
    /// Base bound for element waits (a 45s floor applies to the slow steps).
    pub explicit_wait_s: u64,
    /// Optional delay before each search (home page JS, SSO redirects).
    pub wait_before_search_s: u64,

    /// Custom Chrome executable (portable installs); validated at launch.
    pub chrome_binary: Option<PathBuf>,
    /// Keep cookies/login in a project-local profile directory.
    pub use_isolated_profile: bool,
    /// Pause for a manual SSO/MFA login before proceeding.
    pub sso_mode: bool,

    /// Browser window geometry. The coordinate modes assume it never changes
    /// after launch.
    pub window_width: u32,
    pub window_height: u32,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. `from_env`
    /// delegates here; tests pass a map instead of mutating the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get_trim = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let instance_url = get_trim("INSTANCE_URL").unwrap_or_default();
        if instance_url.is_empty() {
            bail!("INSTANCE_URL must be set (the target ServiceNow instance)");
        }
        Url::parse(&instance_url)
            .with_context(|| format!("INSTANCE_URL is not a valid URL: {instance_url}"))?;

        let excel_path = get_trim("EXCEL_PATH").unwrap_or_else(|| DEFAULT_EXCEL_PATH.to_string());

        let max_rows = parse_num::<u64>(&get, "MAX_ROWS", 0)?;

        Ok(Self {
            instance_url,
            username: get_trim("SN_USER").unwrap_or_default(),
            password: get_trim("SN_PASS").unwrap_or_default(),
            excel_path: PathBuf::from(excel_path),
            excel_sheet: get_trim("EXCEL_SHEET").unwrap_or_else(|| DEFAULT_EXCEL_SHEET.to_string()),
            excel_column: get_trim("EXCEL_COLUMN")
                .unwrap_or_else(|| DEFAULT_EXCEL_COLUMN.to_string()),
            max_rows: (max_rows > 0).then_some(max_rows as usize),
            facility_type_text: get_trim("FACILITY_TYPE")
                .unwrap_or_else(|| DEFAULT_FACILITY_TYPE.to_string()),
            use_coordinate_save: parse_bool(&get, "USE_COORDINATE_SAVE", false),
            right_click_x: parse_num(&get, "RIGHT_CLICK_X", 1328)?,
            right_click_y: parse_num(&get, "RIGHT_CLICK_Y", 190)?,
            use_coordinate_search: parse_bool(&get, "USE_COORDINATE_SEARCH", false),
            search_click_x: parse_num(&get, "SEARCH_CLICK_X", 0)?,
            search_click_y: parse_num(&get, "SEARCH_CLICK_Y", 0)?,
            implicit_wait_s: parse_num(&get, "IMPLICIT_WAIT", 2)?,
            explicit_wait_s: parse_num(&get, "EXPLICIT_WAIT", 25)?,
            wait_before_search_s: parse_num(&get, "WAIT_BEFORE_SEARCH", 0)?,
            chrome_binary: get_trim("CHROME_BINARY").map(PathBuf::from),
            use_isolated_profile: parse_bool(&get, "USE_ISOLATED_PROFILE", true),
            sso_mode: parse_bool(&get, "SSO_MODE", false),
            window_width: parse_num(&get, "WINDOW_WIDTH", 1280)?,
            window_height: parse_num(&get, "WINDOW_HEIGHT", 720)?,
        })
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key) {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_num<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a number, got '{}'", v.trim())),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_instance_url_is_fatal() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("INSTANCE_URL"));
    }

    #[test]
    fn test_invalid_instance_url_is_fatal() {
        let err =
            Config::from_lookup(lookup(&[("INSTANCE_URL", "not a url")])).unwrap_err();
        assert!(err.to_string().contains("INSTANCE_URL"));
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[(
            "INSTANCE_URL",
            "https://example.service-now.com",
        )]))
        .unwrap();
        assert_eq!(cfg.excel_path, PathBuf::from(DEFAULT_EXCEL_PATH));
        assert_eq!(cfg.excel_sheet, DEFAULT_EXCEL_SHEET);
        assert_eq!(cfg.excel_column, DEFAULT_EXCEL_COLUMN);
        assert_eq!(cfg.facility_type_text, DEFAULT_FACILITY_TYPE);
        assert_eq!(cfg.max_rows, None);
        assert_eq!(cfg.explicit_wait_s, 25);
        assert_eq!(cfg.right_click_x, 1328);
        assert_eq!(cfg.right_click_y, 190);
        assert!(!cfg.use_coordinate_save);
        assert!(!cfg.use_coordinate_search);
        assert!(cfg.use_isolated_profile);
        assert!(!cfg.sso_mode);
        assert_eq!(cfg.chrome_binary, None);
    }

    #[test]
    fn test_max_rows_zero_means_unlimited() {
        let cfg = Config::from_lookup(lookup(&[
            ("INSTANCE_URL", "https://example.service-now.com"),
            ("MAX_ROWS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_rows, None);

        let cfg = Config::from_lookup(lookup(&[
            ("INSTANCE_URL", "https://example.service-now.com"),
            ("MAX_ROWS", "7"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_rows, Some(7));
    }

    #[test]
    fn test_garbage_number_is_fatal() {
        let err = Config::from_lookup(lookup(&[
            ("INSTANCE_URL", "https://example.service-now.com"),
            ("RIGHT_CLICK_X", "abc"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RIGHT_CLICK_X"));
    }

    #[test]
    fn test_bool_parsing_is_case_insensitive() {
        let cfg = Config::from_lookup(lookup(&[
            ("INSTANCE_URL", "https://example.service-now.com"),
            ("USE_COORDINATE_SAVE", "TRUE"),
            ("USE_ISOLATED_PROFILE", "false"),
        ]))
        .unwrap();
        assert!(cfg.use_coordinate_save);
        assert!(!cfg.use_isolated_profile);
    }

    #[test]
    fn test_values_are_trimmed() {
        let cfg = Config::from_lookup(lookup(&[
            ("INSTANCE_URL", "  https://example.service-now.com  "),
            ("SN_USER", " admin "),
        ]))
        .unwrap();
        assert_eq!(cfg.instance_url, "https://example.service-now.com");
        assert_eq!(cfg.username, "admin");
    }
}
