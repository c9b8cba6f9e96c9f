//! # Player Configuration Module
//!
//! Risoluzione della configurazione del player inline.
//!
//! ## Responsabilità:
//! - `GlobalConfig`: snapshot versionato dei default globali, iniettato esplicitamente
//! - `PlayerOverride`: override parziale per istanza, parsato dal markup embedded
//! - `ConfigResolver`: parse tollerante, merge campo per campo, serializzazione canonica
//!
//! ## Regola di risoluzione:
//! `override` > `global` > default built-in, campo per campo. I valori numerici
//! vengono clampati (volume in [0,1], `end >= start`, dimensioni in [1, 7680]).
//!
//! ## Formato embedded:
//! ```html
//! <config option="autoplay">true</config>
//! <config option="volume">0.5</config>
//! <config option="end">null</config>
//! ```
//! `null` (o valore vuoto) significa "non impostato".

use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Largest width/height accepted for an embedded player
pub const MAX_DIMENSION: u32 = 7680;

/// Fully resolved player configuration handed to the front-end
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    pub autoplay: bool,
    pub loop_playback: bool,
    pub controls: bool,
    pub mute: bool,
    pub volume: f64,
    pub start: Duration,
    pub end: Option<Duration>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fluid: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            autoplay: true,
            loop_playback: true,
            controls: true,
            mute: false,
            volume: 1.0,
            start: Duration::ZERO,
            end: None,
            width: None,
            height: None,
            fluid: false,
        }
    }
}

/// Partial configuration: only the fields that were explicitly set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerOverride {
    pub autoplay: Option<bool>,
    pub loop_playback: Option<bool>,
    pub controls: Option<bool>,
    pub mute: Option<bool>,
    pub volume: Option<f64>,
    pub start: Option<Duration>,
    pub end: Option<Duration>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fluid: Option<bool>,
}

impl PlayerOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply a size specification (`640x360`, `auto`, `default`)
    pub fn apply_size(&mut self, size: SizeSpec) {
        match size {
            SizeSpec::Fixed { width, height } => {
                self.width = Some(width);
                self.height = Some(height);
                self.fluid = Some(false);
            }
            SizeSpec::Auto => self.fluid = Some(true),
            SizeSpec::Default => self.fluid = Some(false),
        }
    }

    /// Set a single option from its textual form.
    ///
    /// Returns `Ok(false)` for unknown keys; invalid values are reported as
    /// `Err` with a human readable reason.
    fn set_option(&mut self, key: &str, raw: &str) -> std::result::Result<bool, String> {
        let value = raw.trim();
        let is_null = value.is_empty() || value.eq_ignore_ascii_case("null");

        match key {
            "autoplay" => self.autoplay = parse_opt(is_null, value, parse_bool)?,
            "loop" => self.loop_playback = parse_opt(is_null, value, parse_bool)?,
            "controls" => self.controls = parse_opt(is_null, value, parse_bool)?,
            "mute" => self.mute = parse_opt(is_null, value, parse_bool)?,
            "fluid" => self.fluid = parse_opt(is_null, value, parse_bool)?,
            "volume" => self.volume = parse_opt(is_null, value, parse_finite)?,
            "start" => self.start = parse_opt(is_null, value, parse_seconds)?,
            "end" => self.end = parse_opt(is_null, value, parse_seconds)?,
            "width" => self.width = parse_opt(is_null, value, parse_dimension)?,
            "height" => self.height = parse_opt(is_null, value, parse_dimension)?,
            "size" => {
                if !is_null {
                    let size = SizeSpec::parse(value)
                        .ok_or_else(|| format!("invalid size '{}'", value))?;
                    self.apply_size(size);
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Size specification accepted by the `size` option and the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Fixed { width: u32, height: u32 },
    Auto,
    Default,
}

impl SizeSpec {
    pub fn parse(input: &str) -> Option<Self> {
        static SIZE_RE: OnceLock<Regex> = OnceLock::new();
        let re = SIZE_RE.get_or_init(|| {
            Regex::new(r"(?i)^\s*([0-9]+)(?:\s*px\s*)?[x\s,:\-/\\]+([0-9]+)(?:\s*px\s*)?\s*$")
                .expect("size pattern is valid")
        });

        if let Some(caps) = re.captures(input) {
            let width = caps[1].parse().ok()?;
            let height = caps[2].parse().ok()?;
            return Some(SizeSpec::Fixed { width, height });
        }

        match input.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(SizeSpec::Auto),
            "default" => Some(SizeSpec::Default),
            _ => None,
        }
    }
}

/// On-disk form of the global player settings (the add-on style settings object)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    pub autoplay: Option<bool>,
    #[serde(rename = "loop")]
    pub loop_playback: Option<bool>,
    pub controls: Option<bool>,
    pub mute: Option<bool>,
    pub volume: Option<f64>,
    /// Playback start, in seconds
    pub start: Option<f64>,
    /// Playback end, in seconds
    pub end: Option<f64>,
    /// `"<w>x<h>"`, `"auto"` or `"default"`
    pub size: Option<String>,
}

impl PlayerSettings {
    pub fn to_override(&self) -> PlayerOverride {
        let mut values = PlayerOverride {
            autoplay: self.autoplay,
            loop_playback: self.loop_playback,
            controls: self.controls,
            mute: self.mute,
            volume: self.volume.filter(|v| v.is_finite()),
            start: self.start.and_then(seconds_to_duration),
            end: self.end.and_then(seconds_to_duration),
            ..Default::default()
        };

        if let Some(ref size) = self.size {
            match SizeSpec::parse(size) {
                Some(spec) => values.apply_size(spec),
                None => warn!("Ignoring invalid player size setting: {}", size),
            }
        }

        values
    }
}

/// Versioned snapshot of the process-wide player defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfig {
    version: u64,
    values: PlayerOverride,
}

impl GlobalConfig {
    pub fn new(values: PlayerOverride) -> Self {
        Self { version: 1, values }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn values(&self) -> &PlayerOverride {
        &self.values
    }

    /// Produce the next snapshot; earlier snapshots stay valid for whoever holds them
    pub fn updated(&self, values: PlayerOverride) -> Self {
        Self {
            version: self.version + 1,
            values,
        }
    }
}

/// Parse, merge and serialize player configuration
pub struct ConfigResolver;

impl ConfigResolver {
    /// Parse the `<config option="…">` children of an embed into an override.
    ///
    /// Unknown options and unparseable values are skipped with a warning.
    /// Only structurally broken markup fails.
    pub fn parse_override(markup: &str) -> Result<PlayerOverride> {
        let mut values = PlayerOverride::default();
        let mut seen: BTreeMap<String, String> = BTreeMap::new();

        let elements = config_elements(markup)?;
        for (key, raw) in elements {
            let Some(key) = key else {
                warn!("Ignoring <config> element without an option attribute");
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let raw = raw.trim().to_string();

            if let Some(previous) = seen.get(&key) {
                if *previous != raw {
                    return Err(PipelineError::ConfigParse(format!(
                        "option '{}' given twice with different values",
                        key
                    )));
                }
                continue;
            }

            match values.set_option(&key, &raw) {
                Ok(true) => {}
                Ok(false) => warn!("Ignoring unknown player option: {}", key),
                Err(reason) => warn!("Ignoring player option {}: {}", key, reason),
            }
            seen.insert(key, raw);
        }

        Ok(values)
    }

    /// Merge field by field: override, then global, then built-in default
    pub fn resolve(global: &GlobalConfig, instance: &PlayerOverride) -> PlayerConfig {
        let defaults = PlayerConfig::default();
        let g = &global.values;

        let volume = instance
            .volume
            .or(g.volume)
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.volume)
            .clamp(0.0, 1.0);

        let start = truncate_millis(instance.start.or(g.start).unwrap_or(defaults.start));
        let end = instance
            .end
            .or(g.end)
            .map(|end| truncate_millis(end).max(start));

        PlayerConfig {
            autoplay: instance.autoplay.or(g.autoplay).unwrap_or(defaults.autoplay),
            loop_playback: instance
                .loop_playback
                .or(g.loop_playback)
                .unwrap_or(defaults.loop_playback),
            controls: instance.controls.or(g.controls).unwrap_or(defaults.controls),
            mute: instance.mute.or(g.mute).unwrap_or(defaults.mute),
            volume,
            start,
            end,
            width: instance.width.or(g.width).map(clamp_dimension),
            height: instance.height.or(g.height).map(clamp_dimension),
            fluid: instance.fluid.or(g.fluid).unwrap_or(defaults.fluid),
        }
    }

    /// Resolve straight from embed markup; malformed config degrades to the global snapshot
    pub fn resolve_markup(global: &GlobalConfig, markup: &str) -> PlayerConfig {
        let instance = match Self::parse_override(markup) {
            Ok(instance) => instance,
            Err(e) => {
                warn!("Falling back to global player config: {}", e);
                PlayerOverride::default()
            }
        };
        Self::resolve(global, &instance)
    }

    /// Canonical markup: every option, fixed order, `null` for unset
    pub fn serialize(config: &PlayerConfig) -> String {
        let entries = [
            ("autoplay", config.autoplay.to_string()),
            ("loop", config.loop_playback.to_string()),
            ("controls", config.controls.to_string()),
            ("mute", config.mute.to_string()),
            ("volume", config.volume.to_string()),
            ("start", format_seconds(config.start)),
            ("end", config.end.map(format_seconds).unwrap_or_else(null)),
            ("width", config.width.map(|w| w.to_string()).unwrap_or_else(null)),
            ("height", config.height.map(|h| h.to_string()).unwrap_or_else(null)),
            ("fluid", config.fluid.to_string()),
        ];

        entries
            .iter()
            .map(|(key, value)| format!("<config option=\"{}\">{}</config>", key, value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn null() -> String {
    "null".to_string()
}

/// Extract `(option, text)` pairs of every `<config>` element
fn config_elements(markup: &str) -> Result<Vec<(Option<String>, String)>> {
    static OPEN_RE: OnceLock<Regex> = OnceLock::new();
    static ELEMENT_RE: OnceLock<Regex> = OnceLock::new();
    static OPTION_RE: OnceLock<Regex> = OnceLock::new();

    let open_re = OPEN_RE.get_or_init(|| Regex::new(r"(?i)<config\b").expect("open pattern is valid"));
    let element_re = ELEMENT_RE.get_or_init(|| {
        Regex::new(r"(?is)<config\b([^<>]*?)(?:/>|>([^<]*)</config\s*>)").expect("element pattern is valid")
    });
    let option_re = OPTION_RE.get_or_init(|| {
        Regex::new(r#"(?i)\boption\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("option pattern is valid")
    });

    let opened = open_re.find_iter(markup).count();
    let mut elements = Vec::with_capacity(opened);

    for caps in element_re.captures_iter(markup) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let key = option_re.captures(attrs).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .map(|m| m.as_str().to_string())
        });
        let text = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        elements.push((key, decode_entities(text)));
    }

    if elements.len() != opened {
        return Err(PipelineError::ConfigParse(format!(
            "{} <config> elements opened but only {} are well formed",
            opened,
            elements.len()
        )));
    }

    Ok(elements)
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

fn parse_opt<T>(
    is_null: bool,
    value: &str,
    parse: fn(&str) -> std::result::Result<T, String>,
) -> std::result::Result<Option<T>, String> {
    if is_null {
        Ok(None)
    } else {
        parse(value).map(Some)
    }
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", value)),
    }
}

fn parse_finite(value: &str) -> std::result::Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{}' is not a number", value))
}

fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs = parse_finite(value)?;
    seconds_to_duration(secs).ok_or_else(|| format!("'{}' is negative", value))
}

fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_millis((secs * 1000.0).round() as u64))
    } else {
        None
    }
}

fn parse_dimension(value: &str) -> std::result::Result<u32, String> {
    value
        .trim_end_matches("px")
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("'{}' is not a pixel size", value))
}

fn clamp_dimension(value: u32) -> u32 {
    value.clamp(1, MAX_DIMENSION)
}

fn truncate_millis(value: Duration) -> Duration {
    Duration::from_millis(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Seconds with millisecond precision and no trailing zeros (`1.5`, `10`, `0.042`)
fn format_seconds(value: Duration) -> String {
    let millis = value.as_millis();
    let text = format!("{}.{:03}", millis / 1000, millis % 1000);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(values: PlayerOverride) -> GlobalConfig {
        GlobalConfig::new(values)
    }

    #[test]
    fn test_instance_override_wins_field_by_field() {
        let g = global(PlayerOverride {
            autoplay: Some(false),
            loop_playback: Some(true),
            ..Default::default()
        });
        let o = PlayerOverride {
            autoplay: Some(true),
            ..Default::default()
        };

        let resolved = ConfigResolver::resolve(&g, &o);
        assert!(resolved.autoplay);
        assert!(resolved.loop_playback);
        assert!(resolved.controls);
        assert!(!resolved.mute);
    }

    #[test]
    fn test_unset_fields_fall_through_to_defaults() {
        let resolved = ConfigResolver::resolve(&GlobalConfig::default(), &PlayerOverride::default());
        assert_eq!(resolved, PlayerConfig::default());
    }

    #[test]
    fn test_numeric_fields_are_clamped() {
        let o = PlayerOverride {
            volume: Some(3.5),
            start: Some(Duration::from_secs(10)),
            end: Some(Duration::from_secs(4)),
            width: Some(0),
            height: Some(100_000),
            ..Default::default()
        };
        let resolved = ConfigResolver::resolve(&GlobalConfig::default(), &o);
        assert_eq!(resolved.volume, 1.0);
        assert_eq!(resolved.end, Some(Duration::from_secs(10)));
        assert_eq!(resolved.width, Some(1));
        assert_eq!(resolved.height, Some(MAX_DIMENSION));

        let quiet = PlayerOverride {
            volume: Some(-0.2),
            ..Default::default()
        };
        assert_eq!(ConfigResolver::resolve(&GlobalConfig::default(), &quiet).volume, 0.0);
    }

    #[test]
    fn test_huge_start_saturates_instead_of_wrapping() {
        let o = PlayerOverride {
            start: Some(Duration::MAX),
            ..Default::default()
        };
        let resolved = ConfigResolver::resolve(&GlobalConfig::default(), &o);
        assert_eq!(resolved.start, Duration::from_millis(u64::MAX));
        assert!(resolved.start > Duration::from_secs(1_000_000));
    }

    #[test]
    fn test_parse_override_reads_embedded_options() {
        let markup = r#"<video id="v1">
            <source src="clip.webm" type="video/webm">
            <config option="autoplay">false</config>
            <config option="volume"> 0.25 </config>
            <config option="start">1.5</config>
            <config option="loop">null</config>
            <config option="size">640 x 360px</config>
        </video>"#;

        let o = ConfigResolver::parse_override(markup).unwrap();
        assert_eq!(o.autoplay, Some(false));
        assert_eq!(o.volume, Some(0.25));
        assert_eq!(o.start, Some(Duration::from_millis(1500)));
        assert_eq!(o.loop_playback, None);
        assert_eq!(o.width, Some(640));
        assert_eq!(o.height, Some(360));
        assert_eq!(o.fluid, Some(false));
    }

    #[test]
    fn test_parse_override_tolerates_unknown_and_invalid_values() {
        let markup = r#"<config option="playbackRate">2</config>
            <config option="mute">sometimes</config>
            <config>true</config>
            <config option="controls"/>
            <config option="width">320</config>"#;

        let o = ConfigResolver::parse_override(markup).unwrap();
        assert_eq!(o.mute, None);
        assert_eq!(o.controls, None);
        assert_eq!(o.width, Some(320));
    }

    #[test]
    fn test_parse_override_rejects_broken_markup() {
        let unterminated = r#"<config option="autoplay">true"#;
        assert!(matches!(
            ConfigResolver::parse_override(unterminated),
            Err(PipelineError::ConfigParse(_))
        ));

        let nested = r#"<config option="autoplay"><b>true</b></config>"#;
        assert!(ConfigResolver::parse_override(nested).is_err());

        let conflicting = r#"<config option="loop">true</config><config option="loop">false</config>"#;
        assert!(ConfigResolver::parse_override(conflicting).is_err());
    }

    #[test]
    fn test_resolve_markup_degrades_to_global() {
        let g = global(PlayerOverride {
            mute: Some(true),
            ..Default::default()
        });
        let resolved = ConfigResolver::resolve_markup(&g, r#"<config option="mute">false"#);
        assert!(resolved.mute);
    }

    #[test]
    fn test_serialize_is_canonical() {
        let config = PlayerConfig {
            autoplay: false,
            volume: 0.5,
            start: Duration::from_millis(1500),
            end: Some(Duration::from_secs(12)),
            width: Some(640),
            ..Default::default()
        };

        let markup = ConfigResolver::serialize(&config);
        let lines: Vec<&str> = markup.lines().collect();
        assert_eq!(lines[0], r#"<config option="autoplay">false</config>"#);
        assert_eq!(lines[4], r#"<config option="volume">0.5</config>"#);
        assert_eq!(lines[5], r#"<config option="start">1.5</config>"#);
        assert_eq!(lines[6], r#"<config option="end">12</config>"#);
        assert_eq!(lines[8], r#"<config option="height">null</config>"#);
    }

    #[test]
    fn test_serialize_round_trip_over_any_global() {
        let globals = [
            GlobalConfig::default(),
            global(PlayerOverride {
                autoplay: Some(false),
                loop_playback: Some(false),
                volume: Some(0.3),
                width: Some(800),
                height: Some(450),
                end: Some(Duration::from_millis(90_250)),
                ..Default::default()
            }),
        ];
        let overrides = [
            PlayerOverride::default(),
            PlayerOverride {
                autoplay: Some(true),
                mute: Some(true),
                volume: Some(0.1),
                start: Some(Duration::from_micros(2_000_700)),
                fluid: Some(true),
                ..Default::default()
            },
            PlayerOverride {
                volume: Some(7.0),
                start: Some(Duration::from_secs(100)),
                end: Some(Duration::from_secs(3)),
                width: Some(9000),
                ..Default::default()
            },
        ];

        for g in &globals {
            for o in &overrides {
                let resolved = ConfigResolver::resolve(g, o);
                let reparsed = ConfigResolver::parse_override(&ConfigResolver::serialize(&resolved)).unwrap();
                assert_eq!(ConfigResolver::resolve(g, &reparsed), resolved);
            }
        }
    }

    #[test]
    fn test_global_updates_bump_version() {
        let first = GlobalConfig::new(PlayerOverride::default());
        let second = first.updated(PlayerOverride {
            autoplay: Some(false),
            ..Default::default()
        });
        assert_eq!(first.version() + 1, second.version());
        assert_eq!(first.values().autoplay, None);
        assert_eq!(second.values().autoplay, Some(false));
    }

    #[test]
    fn test_size_spec_parsing() {
        assert_eq!(SizeSpec::parse("640x360"), Some(SizeSpec::Fixed { width: 640, height: 360 }));
        assert_eq!(SizeSpec::parse(" 1280px , 720px "), Some(SizeSpec::Fixed { width: 1280, height: 720 }));
        assert_eq!(SizeSpec::parse("AUTO"), Some(SizeSpec::Auto));
        assert_eq!(SizeSpec::parse("default"), Some(SizeSpec::Default));
        assert_eq!(SizeSpec::parse("big"), None);
    }

    #[test]
    fn test_player_settings_json() {
        let settings: PlayerSettings =
            serde_json::from_str(r#"{"autoplay": false, "loop": true, "volume": 0.8, "size": "auto"}"#).unwrap();
        let values = settings.to_override();
        assert_eq!(values.autoplay, Some(false));
        assert_eq!(values.loop_playback, Some(true));
        assert_eq!(values.volume, Some(0.8));
        assert_eq!(values.fluid, Some(true));
    }
}
